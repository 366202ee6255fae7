//! `post`: send a message, optionally with attachments or as a reply.

use bytes::Bytes;

use matterlink_core::{CoreError, Session};

use crate::cli::{GlobalOpts, OutputFormat, PostArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(session: &Session, args: PostArgs, global: &GlobalOpts) -> Result<(), CliError> {
    session.connect().await?;

    let cache = session.cache();
    let team_id = cache.primary_team().await.map(|t| t.id);
    let channel_id = cache
        .channel_id(&args.channel, team_id.as_deref())
        .await
        .ok_or_else(|| CoreError::ChannelNotFound {
            name: args.channel.clone(),
        })?;

    let mut file_ids = Vec::with_capacity(args.file.len());
    for path in &args.file {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CliError::Validation {
                field: "file".into(),
                reason: format!("not a file path: {}", path.display()),
            })?
            .to_owned();
        let data = Bytes::from(tokio::fs::read(path).await?);
        let info = session.upload_file(&channel_id, &name, data).await?;
        tracing::debug!(file_id = %info.id, name = %info.name, "uploaded attachment");
        file_ids.push(info.id);
    }

    let root_id = args.reply_to.as_deref().unwrap_or_default();
    let post = session
        .post_message_with_files(&channel_id, &args.message, root_id, &file_ids)
        .await?;

    let rendered = match global.output {
        OutputFormat::Json => output::render_json(&post, false),
        OutputFormat::JsonCompact => output::render_json(&post, true),
        OutputFormat::Plain | OutputFormat::Table => post.id,
    };
    output::print_output(&rendered, global.quiet);
    Ok(())
}
