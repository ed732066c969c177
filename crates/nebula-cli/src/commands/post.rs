//! Post, like and comment handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use nebula_core::{ListName, LoadOutcome, MediaUpload, SyncEngine};

use crate::commands::require_session;
use crate::output::Output;

/// Page through the feed until `post_id` is loaded
async fn find_post(engine: &SyncEngine, post_id: &str) -> Result<()> {
    engine
        .refresh(&ListName::Feed)
        .await
        .context("Failed to load feed")?;
    loop {
        if engine.feed().await.iter().any(|p| p.id == post_id) {
            return Ok(());
        }
        match engine.load_more(&ListName::Feed).await? {
            LoadOutcome::Loaded { .. } | LoadOutcome::Stale => {}
            LoadOutcome::Skipped => bail!("Post not found: {}", post_id),
        }
    }
}

pub async fn like(engine: &SyncEngine, post_id: &str, output: &Output) -> Result<()> {
    require_session(engine).await?;
    find_post(engine, post_id).await?;

    let liked = engine.like_post(post_id).await.context("Like failed")?;
    let count = engine
        .feed()
        .await
        .iter()
        .find(|p| p.id == post_id)
        .map(|p| p.like_count)
        .unwrap_or_default();
    let verb = if liked { "Liked" } else { "Unliked" };
    output.success(&format!("{} post {} ({} likes)", verb, post_id, count));
    Ok(())
}

/// Add a comment, or print the thread when no text is given
pub async fn comment(
    engine: &SyncEngine,
    post_id: &str,
    text: Option<String>,
    reply_to: Option<String>,
    output: &Output,
) -> Result<()> {
    let list = ListName::Comments(post_id.to_string());
    let Some(text) = text else {
        engine
            .refresh(&list)
            .await
            .context("Failed to load comments")?;
        output.print_comments(&engine.comments(post_id).await);
        return Ok(());
    };

    require_session(engine).await?;
    let comment = engine
        .add_comment(post_id, &text, reply_to.as_deref())
        .await
        .context("Comment failed")?;
    output.success(&format!("Commented on post {} ({})", post_id, comment.id));
    Ok(())
}

pub async fn create(
    engine: &SyncEngine,
    text: &str,
    media: Vec<PathBuf>,
    community: Option<String>,
    output: &Output,
) -> Result<()> {
    require_session(engine).await?;

    let uploads = media
        .iter()
        .map(|path| read_media(path))
        .collect::<Result<Vec<_>>>()?;

    let post = engine
        .create_post(text, uploads, community.as_deref())
        .await
        .context("Publishing failed")?;
    output.print_post(&post);
    Ok(())
}

pub async fn delete(engine: &SyncEngine, post_id: &str, output: &Output) -> Result<()> {
    require_session(engine).await?;
    find_post(engine, post_id).await?;

    engine
        .delete_post(post_id)
        .await
        .context("Delete failed")?;
    output.success(&format!("Deleted post {}", post_id));
    Ok(())
}

fn read_media(path: &Path) -> Result<MediaUpload> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("Media path has no file name")?
        .to_string();
    Ok(MediaUpload {
        content_type: content_type(path).to_string(),
        file_name,
        bytes,
    })
}

fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("cat.PNG")), "image/png");
        assert_eq!(content_type(Path::new("a/b.jpeg")), "image/jpeg");
        assert_eq!(content_type(Path::new("notes")), "application/octet-stream");
    }

    #[test]
    fn test_read_media() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mp4");
        std::fs::write(&path, [0u8, 1, 2]).unwrap();

        let upload = read_media(&path).unwrap();
        assert_eq!(upload.file_name, "clip.mp4");
        assert_eq!(upload.content_type, "video/mp4");
        assert_eq!(upload.bytes, vec![0, 1, 2]);
    }

    #[test]
    fn test_read_media_missing_file() {
        assert!(read_media(Path::new("/nonexistent/cat.png")).is_err());
    }
}
