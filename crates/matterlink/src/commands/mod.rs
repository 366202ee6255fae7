//! Command dispatch: bridges CLI args -> session operations -> output.

pub mod channels;
pub mod config_cmd;
pub mod listen;
pub mod post;
pub mod status;

use matterlink_core::{Session, SessionConfig};

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a server-bound command to the appropriate handler.
///
/// Every command gets a fresh session that is logged out afterwards,
/// whether the command succeeded or not.
pub async fn dispatch(
    cmd: Command,
    mut config: SessionConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    if let Command::Listen(ref args) = cmd {
        listen::configure(&mut config, args);
    }
    let session = Session::new(config)?;

    let result = match cmd {
        Command::Listen(args) => listen::handle(&session, args, global).await,
        Command::Channels(args) => channels::handle(&session, args, global).await,
        Command::Post(args) => post::handle(&session, args, global).await,
        Command::Status(args) => status::handle(&session, args, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => Ok(()),
    };

    if let Err(e) = session.logout().await {
        tracing::warn!(error = %e, "logout failed");
    }
    result
}
