//! Fetch pages through the browser pool.

use std::path::Path;
use std::sync::Arc;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use bumi::browser::{ChromiumFactory, ChromiumOptions, FetchedPage};
use bumi::config::Settings;
use bumi::job::{JobEvent, JobRunner};
use bumi::pacer::RatePacer;
use bumi::pool::ResourcePool;
use bumi::validate::normalize_profile_url;

use crate::cli::helpers::sanitize_filename;

/// URLs pass through; anything else is treated as a username.
fn resolve_targets(inputs: &[String]) -> anyhow::Result<Vec<String>> {
    inputs
        .iter()
        .map(|input| {
            let input = input.trim();
            if input.starts_with("http://") || input.starts_with("https://") {
                url::Url::parse(input)?;
                Ok(input.to_string())
            } else {
                Ok(normalize_profile_url(input)?)
            }
        })
        .collect()
}

pub async fn cmd_fetch(
    settings: &Settings,
    inputs: &[String],
    out: &Path,
    wait_for: Option<&str>,
    no_cache: bool,
) -> anyhow::Result<()> {
    let targets = resolve_targets(inputs)?;
    std::fs::create_dir_all(out)?;

    let webhooks = settings.webhook_registry()?;
    let cache = if no_cache { None } else { settings.open_cache()? };
    let bar_style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")?
        .progress_chars("█▓░");

    let pool_size = settings.pool.size.min(targets.len()).max(1);
    println!(
        "{} Starting {} browser(s) for {} page(s)",
        style("→").cyan(),
        pool_size,
        targets.len()
    );
    let factory = ChromiumFactory::new(ChromiumOptions::from_settings(settings));
    let pool = Arc::new(ResourcePool::start(pool_size, &factory).await?);

    let (event_tx, mut event_rx) = mpsc::channel::<JobEvent>(100);
    let mut runner = JobRunner::new(
        Arc::clone(&pool),
        Arc::new(RatePacer::new(settings.pacer_config())),
    )
    .with_retry(settings.retry_policy())
    .with_acquire_timeout(settings.acquire_timeout())
    .with_webhooks(webhooks.clone())
    .with_events(event_tx);

    let use_cache = cache.is_some();
    if let Some(cache) = cache {
        runner = runner.with_cache(cache, settings.cache_ttl());
    }

    let pb = ProgressBar::new(targets.len() as u64);
    pb.set_style(bar_style);
    let progress_pb = pb.clone();
    let progress = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                JobEvent::BatchStarted { .. } => {}
                JobEvent::JobCompleted { target, cached } => {
                    let marker = if cached { " (cached)" } else { "" };
                    progress_pb.set_message(format!("{}{}", target, marker));
                    progress_pb.inc(1);
                }
                JobEvent::JobFailed { target, error } => {
                    progress_pb.println(format!("{} {}: {}", style("✗").red(), target, error));
                    progress_pb.inc(1);
                }
                JobEvent::BatchComplete { .. } => progress_pb.finish_and_clear(),
            }
        }
    });

    let wait_for = wait_for.map(str::to_string);
    let report = runner
        .run_batch(
            &targets,
            |url| use_cache.then(|| format!("page:{}", url)),
            |target, browser| {
                let wait_for = wait_for.clone();
                async move { browser.fetch_html(&target, wait_for.as_deref()).await }
            },
        )
        .await;

    drop(runner);
    let _ = progress.await;
    pb.finish_and_clear();
    pool.close().await;

    for outcome in &report.outcomes {
        if let Ok(page) = &outcome.result {
            let path = write_page(out, page)?;
            println!(
                "{} {} -> {}",
                style("✓").green(),
                outcome.target,
                path.display()
            );
        }
    }

    println!(
        "\n{} {} fetched, {} failed",
        style("Done:").bold(),
        report.summary.successful,
        report.summary.failed
    );

    webhooks.flush().await;

    if report.summary.failed > 0 {
        anyhow::bail!("{} page(s) failed", report.summary.failed);
    }
    Ok(())
}

fn write_page(out: &Path, page: &FetchedPage) -> anyhow::Result<std::path::PathBuf> {
    let path = out.join(format!("{}.html", sanitize_filename(&page.url)));
    std::fs::write(&path, &page.html)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_targets() {
        let targets = resolve_targets(&[
            "alice".to_string(),
            "https://letterboxd.com/bob/films/".to_string(),
        ])
        .unwrap();
        assert_eq!(
            targets,
            vec![
                "https://letterboxd.com/alice/".to_string(),
                "https://letterboxd.com/bob/films/".to_string(),
            ]
        );
    }

    #[test]
    fn test_resolve_targets_rejects_bad_username() {
        assert!(resolve_targets(&["not a user!".to_string()]).is_err());
    }
}
