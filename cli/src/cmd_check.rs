//! `chainevent check`

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;

use chainevent_evm::LogFilterDecoder;
use chainevent_service::Config;

pub fn run(path: &Path, json: bool) -> Result<()> {
    let config = Config::load(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    let subscriptions = config.subscriptions()?;

    let mut report = Vec::with_capacity(subscriptions.len());
    for sub in &subscriptions {
        let decoder = LogFilterDecoder::new(sub)
            .with_context(|| format!("subscription '{}' is invalid", sub.alias))?;
        report.push(json!({
            "alias": sub.alias,
            "addresses": sub.addresses,
            "event": sub.event_name,
            "start_block": sub.start_block,
            "filters": sub.filters,
            "topics": decoder.topics(),
            "webhook": sub.webhook,
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Config:        {}", path.display());
    println!("RPC node:      {}", config.chain.rpc_node);
    println!("Confirmations: {}", config.chain.delay_block);
    println!("Subscriptions: {}", subscriptions.len());
    for sub in &subscriptions {
        println!();
        println!("  {}", sub.alias);
        println!("    contracts:   {}", sub.addresses.join(", "));
        println!(
            "    event:       {}",
            sub.event_name.as_deref().unwrap_or("(any)")
        );
        println!("    start block: {}", sub.start_block);
        for (field, value) in &sub.filters {
            println!("    filter:      {field} = {value}");
        }
        if let Some(hook) = &sub.webhook {
            println!("    webhook:     {hook}");
        }
    }
    println!();
    println!("OK");
    Ok(())
}
