use crate::cli::actions::{migrate, sweep, Action};
use anyhow::Result;

/// Execute the provided action.
/// # Errors
/// Returns an error if the action fails.
pub async fn execute(action: Action) -> Result<()> {
    match action {
        Action::Migrate(args) => migrate::execute(args).await,
        Action::Sweep(args) => sweep::execute(args).await,
    }
}
