//! Profile lookup and listing (`profiles` table)

use anyhow::{bail, Context, Result};

use super::client::BackendClient;
use crate::models::Profile;
use crate::realtime::presence;

/// Fetch a single profile by user id.
pub async fn get_profile(client: &BackendClient, user_id: &str) -> Result<Profile> {
    let query = format!("select=*&id=eq.{}", user_id);
    let resp = client.rest_select("profiles", &query).await?;
    let rows: Vec<Profile> = resp
        .json()
        .await
        .context("Failed to parse profiles response")?;

    match rows.into_iter().next() {
        Some(profile) => Ok(profile),
        None => bail!("No profile row for user {}", user_id),
    }
}

/// List every profile except our own, ordered by username.
pub async fn list_profiles(client: &BackendClient) -> Result<Vec<Profile>> {
    let query = format!("select=*&id=neq.{}&order=username.asc", client.user_id());
    let resp = client.rest_select("profiles", &query).await?;
    resp.json()
        .await
        .context("Failed to parse profiles response")
}

/// Look up a profile by exact username.
pub async fn find_by_username(client: &BackendClient, username: &str) -> Result<Profile> {
    let query = format!("select=*&username=eq.{}", username);
    let resp = client.rest_select("profiles", &query).await?;
    let rows: Vec<Profile> = resp
        .json()
        .await
        .context("Failed to parse profiles response")?;

    match rows.into_iter().next() {
        Some(profile) => Ok(profile),
        None => bail!("No user named '{}'", username),
    }
}

/// Fill in our own profile row. The signup trigger creates it with the
/// name fields null; chat partners see the raw id until this runs.
pub async fn complete_profile(
    username: &str,
    first_name: &str,
    last_name: &str,
) -> Result<()> {
    let client = BackendClient::new().await?;
    let filter = format!("id=eq.{}", client.user_id());
    let body = serde_json::json!({
        "username": username,
        "first_name": first_name,
        "last_name": last_name,
    });

    client.rest_update("profiles", &filter, &body).await?;
    println!("Profile updated: @{} ({} {})", username, first_name, last_name);
    Ok(())
}

/// Show the signed-in user (prints to stdout).
pub async fn whoami() -> Result<()> {
    let client = BackendClient::new().await?;
    let profile = get_profile(&client, client.user_id()).await?;

    println!();
    println!(
        "Username:     {}",
        profile
            .username
            .as_deref()
            .map(|u| format!("@{}", u))
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!("Display Name: {}", profile.display_name());
    println!("Email:        {}", client.email().unwrap_or("(none)"));
    println!("ID:           {}", profile.id);

    if !profile.is_complete() {
        println!();
        println!("Profile incomplete. Run 'huddle-cli complete-profile <username> <first> <last>'.");
    }

    Ok(())
}

/// List users with online markers (prints to stdout).
pub async fn list_users() -> Result<()> {
    let client = BackendClient::new().await?;
    let profiles = list_profiles(&client).await?;

    // Best-effort presence snapshot; the listing works without it.
    let online = match presence::online_snapshot(&client).await {
        Ok(set) => set,
        Err(e) => {
            tracing::warn!("Presence snapshot failed: {:#}", e);
            Default::default()
        }
    };

    println!("\nUsers:");
    println!("{:-<60}", "");

    if profiles.is_empty() {
        println!("  (no other users)");
        return Ok(());
    }

    for profile in &profiles {
        let marker = if online.contains(&profile.id) { "●" } else { "○" };
        let username = profile.username.as_deref().unwrap_or("-");
        println!("{} @{:<20} {}", marker, username, profile.display_name());
    }

    Ok(())
}
