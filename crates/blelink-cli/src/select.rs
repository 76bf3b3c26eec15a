//! Terminal prompt backing interactive peripheral selection.

use std::io::{self, IsTerminal};

use async_trait::async_trait;
use blelink_core::btle::{Candidate, PeripheralChooser, StrongestSignal};
use blelink_core::{Error, PeripheralRef};
use dialoguer::{Select, theme::ColorfulTheme};

/// Asks the user to pick a peripheral from the scan results.
///
/// Escape or `q` cancels the selection. Without a terminal the strongest
/// candidate is picked instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptChooser;

#[async_trait]
impl PeripheralChooser for PromptChooser {
    async fn choose(&self, candidates: Vec<Candidate>) -> blelink_core::Result<PeripheralRef> {
        if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
            tracing::debug!("No terminal attached, picking strongest signal");
            return StrongestSignal.choose(candidates).await;
        }

        tokio::task::spawn_blocking(move || prompt(candidates))
            .await
            .map_err(|e| Error::Other(format!("selection prompt failed: {}", e)))?
    }
}

fn prompt(mut candidates: Vec<Candidate>) -> blelink_core::Result<PeripheralRef> {
    let items: Vec<String> = candidates.iter().map(ToString::to_string).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a peripheral (Esc to cancel)")
        .items(&items)
        .default(0)
        .interact_opt()
        .map_err(|e| Error::Other(format!("selection prompt failed: {}", e)))?;

    match selection {
        Some(index) if index < candidates.len() => Ok(candidates.swap_remove(index).peripheral),
        _ => Err(Error::Cancelled),
    }
}
