//! Subcommand implementations.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use rust_decimal::Decimal;
use tracing::{info, warn};

use ratebridge_common::{CurrencyPair, CurrencyTable};
use ratebridge_fx::{EngineConfig, FetchResult, RateFetcher, RuleSet, SourceRegistry};

/// Arguments of `ratebridge rates`.
#[derive(Debug, Clone)]
pub struct RatesRequest {
    pub rules_text: String,
    pub default_rule: String,
    pub spread: Option<Decimal>,
    pub preview: bool,
    pub pairs: Vec<String>,
}

impl RatesRequest {
    fn rule_set(&self) -> anyhow::Result<RuleSet> {
        let rules = RuleSet::parse(&self.rules_text, &self.default_rule)
            .context("Invalid rule text")?;
        Ok(match self.spread {
            Some(spread) => rules.with_spread(spread),
            None => rules,
        })
    }

    fn parsed_pairs(&self) -> anyhow::Result<Vec<CurrencyPair>> {
        self.pairs
            .iter()
            .map(|p| CurrencyPair::parse(p).with_context(|| format!("Invalid pair '{p}'")))
            .collect()
    }
}

/// Resolve the requested pairs and render them as pretty JSON, ordered by pair.
pub async fn rates(config: &EngineConfig, request: RatesRequest) -> anyhow::Result<String> {
    let registry = SourceRegistry::from_config(config)?;
    let fetcher = RateFetcher::new(Arc::new(registry));
    run_rates(&fetcher, &request).await
}

pub async fn run_rates(fetcher: &RateFetcher, request: &RatesRequest) -> anyhow::Result<String> {
    let rules = request.rule_set()?;
    let pairs = request.parsed_pairs()?;

    info!(pairs = pairs.len(), preview = request.preview, "Resolving rates");
    let results = if request.preview {
        fetcher.preview(&pairs, &rules).await?
    } else {
        fetcher.fetch_rates(&pairs, &rules).await?
    };

    let unresolved = results.values().filter(|r| !r.is_ok()).count();
    if unresolved > 0 {
        warn!(unresolved, "Some pairs could not be resolved");
    }

    let ordered: BTreeMap<String, FetchResult> = results
        .into_iter()
        .map(|(pair, result)| (pair.to_string(), result))
        .collect();
    Ok(serde_json::to_string_pretty(&ordered)?)
}

/// `display_format` of an amount.
pub fn format(amount: Decimal, code: &str) -> String {
    CurrencyTable::global().display_format(amount, code)
}

/// One line per source: id, cache mode and fallback members.
pub fn sources(config: &EngineConfig) -> anyhow::Result<String> {
    let registry = SourceRegistry::from_config(config)?;
    let lines: Vec<String> = registry
        .table()
        .values()
        .map(|slot| {
            let info = slot.info();
            let members: Vec<String> = info.chain.members.iter().map(|m| m.to_string()).collect();
            format!("{}\t{}\t{}", info.chain.id, info.mode, members.join(" -> "))
        })
        .collect();
    Ok(lines.join("\n"))
}
