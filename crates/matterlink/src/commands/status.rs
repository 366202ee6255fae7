//! `status`: set the session user's presence.

use matterlink_core::Session;

use crate::cli::{GlobalOpts, StatusArgs};
use crate::error::CliError;

pub async fn handle(
    session: &Session,
    args: StatusArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    session.connect().await?;
    session.update_status(args.status).await?;
    if !global.quiet {
        eprintln!("status set to {}", args.status);
    }
    Ok(())
}
