//! API client module for the chat backend

pub mod chat;
pub mod client;
pub mod profiles;

use anyhow::Result;

/// Show current user info
pub async fn whoami() -> Result<()> {
    profiles::whoami().await
}

/// Fill in our own profile row
pub async fn complete_profile(username: &str, first_name: &str, last_name: &str) -> Result<()> {
    profiles::complete_profile(username, first_name, last_name).await
}

/// List users with online markers
pub async fn list_users() -> Result<()> {
    profiles::list_users().await
}

/// Read recent messages of the 1:1 conversation with a user
pub async fn read_messages(username: &str, limit: usize) -> Result<()> {
    chat::read_messages(username, limit).await
}

/// Send a moderated text message to a user
pub async fn send_message(username: &str, message: &str) -> Result<()> {
    chat::send_message(username, message).await
}

/// Upload an image and send it to a user
pub async fn send_image(username: &str, file_path: &str) -> Result<()> {
    chat::send_image(username, file_path).await
}

/// Stream new messages of the 1:1 conversation with a user
pub async fn listen(username: &str) -> Result<()> {
    chat::listen(username).await
}
