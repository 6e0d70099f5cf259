//! Conversations and messages
//!
//! Message text passes through the `moderate-message` edge function before
//! insert. The service rewrites disallowed content and the rewritten text is
//! what gets stored; a moderation failure therefore blocks the send instead
//! of bypassing it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::client::BackendClient;
use super::profiles;
use crate::models::{Message, Profile};
use crate::realtime;

/// Bucket holding uploaded chat images.
const IMAGE_BUCKET: &str = "chat-images";

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    moderated_content: String,
}

/// Resolve the 1:1 conversation with a user, creating it on first contact.
/// The database function deduplicates the pair.
pub async fn get_or_create_conversation(
    client: &BackendClient,
    other_user_id: &str,
) -> Result<i64> {
    let args = serde_json::json!({
        "user_1_id": client.user_id(),
        "user_2_id": other_user_id,
    });
    let resp = client.rpc("get_or_create_conversation", &args).await?;
    resp.json()
        .await
        .context("Failed to parse conversation id")
}

/// Fetch the last `limit` messages of a conversation, oldest first.
pub async fn fetch_messages(
    client: &BackendClient,
    conversation_id: i64,
    limit: usize,
) -> Result<Vec<Message>> {
    let query = format!(
        "select=*&conversation_id=eq.{}&order=created_at.desc&limit={}",
        conversation_id, limit
    );
    let resp = client.rest_select("messages", &query).await?;
    let mut messages: Vec<Message> = resp
        .json()
        .await
        .context("Failed to parse messages response")?;

    // Newest-first from the query; reverse for chronological display.
    messages.reverse();
    Ok(messages)
}

/// Run message text through the moderation edge function.
async fn moderate(client: &BackendClient, content: &str) -> Result<String> {
    let body = serde_json::json!({ "content": content });
    let resp = client.invoke_function("moderate-message", &body).await?;
    let moderated: ModerationResponse = resp
        .json()
        .await
        .context("Moderation response missing moderated_content")?;
    Ok(moderated.moderated_content)
}

/// Moderate and insert a text message.
pub async fn send_message_to_conversation(
    client: &BackendClient,
    conversation_id: i64,
    content: &str,
) -> Result<()> {
    let content = content.trim();
    if content.is_empty() {
        bail!("Refusing to send an empty message");
    }

    let moderated = moderate(client, content).await?;
    if moderated != content {
        println!("(moderation rewrote your message)");
    }

    let row = serde_json::json!({
        "content": moderated,
        "user_id": client.user_id(),
        "conversation_id": conversation_id,
        "is_image": false,
    });
    client.rest_insert("messages", &row).await?;
    Ok(())
}

/// Upload an image file and insert a message pointing at its public URL.
pub async fn send_image_to_conversation(
    client: &BackendClient,
    conversation_id: i64,
    file_path: &str,
) -> Result<()> {
    let bytes = tokio::fs::read(file_path)
        .await
        .with_context(|| format!("Failed to read {}", file_path))?;

    let filename = std::path::Path::new(file_path)
        .file_name()
        .and_then(|n| n.to_str())
        .context("Image path has no usable file name")?;

    // Object keys are namespaced by uploader, with a millisecond stamp to
    // keep repeated uploads of the same file distinct.
    let object_path = format!(
        "{}/{}_{}",
        client.user_id(),
        chrono::Utc::now().timestamp_millis(),
        filename
    );

    let url = client
        .upload_object(IMAGE_BUCKET, &object_path, bytes, content_type_for(filename))
        .await?;

    let row = serde_json::json!({
        "content": url,
        "user_id": client.user_id(),
        "conversation_id": conversation_id,
        "is_image": true,
    });
    client.rest_insert("messages", &row).await?;
    Ok(())
}

/// Guess a Content-Type from the file extension.
fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Resolve a username to its profile and 1:1 conversation.
async fn open_conversation(username: &str) -> Result<(BackendClient, Profile, i64)> {
    let client = BackendClient::new().await?;
    let peer = profiles::find_by_username(&client, username).await?;
    let conversation_id = get_or_create_conversation(&client, &peer.id).await?;
    Ok((client, peer, conversation_id))
}

/// Print a conversation's recent history (prints to stdout).
pub async fn read_messages(username: &str, limit: usize) -> Result<()> {
    let (client, peer, conversation_id) = open_conversation(username).await?;
    let messages = fetch_messages(&client, conversation_id, limit).await?;

    if messages.is_empty() {
        println!("(no messages)");
        return Ok(());
    }

    for msg in &messages {
        let sender = if msg.user_id == client.user_id() {
            "me".to_string()
        } else {
            peer.display_name()
        };
        if msg.is_image {
            println!("[{}] {}: [image] {}", msg.short_time(), sender, msg.content);
        } else {
            println!("[{}] {}: {}", msg.short_time(), sender, msg.content);
        }
    }

    Ok(())
}

/// Send a text message to a user.
pub async fn send_message(username: &str, message: &str) -> Result<()> {
    let (client, _peer, conversation_id) = open_conversation(username).await?;
    send_message_to_conversation(&client, conversation_id, message).await?;
    println!("Message sent.");
    Ok(())
}

/// Send an image to a user.
pub async fn send_image(username: &str, file_path: &str) -> Result<()> {
    let (client, _peer, conversation_id) = open_conversation(username).await?;
    send_image_to_conversation(&client, conversation_id, file_path).await?;
    println!("Image sent.");
    Ok(())
}

/// Stream a conversation's new messages until interrupted.
pub async fn listen(username: &str) -> Result<()> {
    let (_client, peer, conversation_id) = open_conversation(username).await?;
    realtime::listen_conversation(conversation_id, &peer).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for_known_extensions() {
        assert_eq!(content_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("diagram.png"), "image/png");
        assert_eq!(content_type_for("anim.gif"), "image/gif");
    }

    #[test]
    fn test_content_type_for_unknown_falls_back() {
        assert_eq!(content_type_for("notes.txt"), "application/octet-stream");
        assert_eq!(content_type_for("no_extension"), "application/octet-stream");
    }
}
