//! Webhook inspection commands.

use console::style;
use serde_json::json;

use bumi::config::Settings;
use bumi::webhook::DEFAULT_EVENTS;

pub fn cmd_webhook_list(settings: &Settings) -> anyhow::Result<()> {
    let registry = settings.webhook_registry()?;

    if registry.is_empty() {
        println!("{} No webhooks configured", style("!").yellow());
        return Ok(());
    }

    println!("\n{}", style("Webhooks").bold());
    println!("{}", "-".repeat(40));
    for (id, hook) in registry.list() {
        let status = if hook.active {
            style("active").green().to_string()
        } else {
            style("paused").dim().to_string()
        };
        println!("  {} [{}]", style(&id).cyan(), status);
        println!("    {}", hook.url);
        println!("    events: {}", hook.events.join(", "));
    }
    Ok(())
}

pub async fn cmd_webhook_test(settings: &Settings, event: &str) -> anyhow::Result<()> {
    if !DEFAULT_EVENTS.contains(&event) {
        println!(
            "{} '{}' is not a standard event ({})",
            style("!").yellow(),
            event,
            DEFAULT_EVENTS.join(", ")
        );
    }

    let registry = settings.webhook_registry()?;
    let deliveries = registry
        .notify_and_wait(event, json!({ "test": true, "message": "bumi webhook test" }))
        .await;

    if deliveries.is_empty() {
        println!("{} No webhooks subscribed to {}", style("!").yellow(), event);
        return Ok(());
    }

    let mut failed = 0;
    for delivery in &deliveries {
        match &delivery.result {
            Ok(status) => println!(
                "{} {} -> {} ({})",
                style("✓").green(),
                delivery.webhook_id,
                delivery.url,
                status
            ),
            Err(e) => {
                failed += 1;
                println!(
                    "{} {} -> {}: {}",
                    style("✗").red(),
                    delivery.webhook_id,
                    delivery.url,
                    e
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} deliveries failed", failed, deliveries.len());
    }
    Ok(())
}
