/// Example: OAuth sign-in from a terminal application
///
/// This example signs a user in with an OAuth provider configured on the
/// auth server. The provider redirects back to a loopback listener, whose
/// URL is fed to the client as its current location so the callback can be
/// claimed and exchanged for tokens.
///
/// Setup:
/// 1. Enable the provider (e.g. GitHub) for your project on the auth server
/// 2. Allow `http://127.0.0.1` as a redirect domain for the project
/// 3. Export the project settings:
///    export SITZUNG_PROJECT_ID="your_project_id"
///    export SITZUNG_BASE_URL="https://auth.example.com"
///    export SITZUNG_PUBLISHABLE_CLIENT_KEY="pck_..."   (optional)
///
///    or point SITZUNG_CONFIG at a config file.
///
/// Run:
/// cargo run --example oauth_login -- github
use sitzung::prelude::*;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sitzung=info")),
        )
        .init();

    let provider = env::args().nth(1).unwrap_or_else(|| "github".to_string());

    println!("=== OAuth Sign-in Example ({}) ===\n", provider);

    let mut config = match env::var("SITZUNG_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => {
            let mut config = ClientConfig::new(
                env::var("SITZUNG_PROJECT_ID")?,
                env::var("SITZUNG_BASE_URL")?,
            );
            config.publishable_client_key = env::var("SITZUNG_PUBLISHABLE_CLIENT_KEY").ok();
            config
        }
    };
    config.urls.oauth_callback = "/callback".to_string();

    // The listener's origin doubles as the client's location
    let callback = LoopbackCallback::bind().await?;
    println!("Listening for the redirect on {}", callback.redirect_uri());

    let location = Arc::new(MemoryLocation::new(callback.base_url()));
    let cookies = Arc::new(FileCookieJar::new("sitzung-examples")?);
    let server = Arc::new(HttpAuthServer::new(&config)?);

    let app = ClientApp::builder(config, server)
        .cookie_jar(cookies)
        .location(location.clone())
        .navigator(location.clone())
        .token_store(TokenStoreInit::Cookie)
        .build()?;

    if let Some(user) = app.get_user(GetUserOptions::default()).await? {
        println!("Already signed in as {}", describe(&user));
        return Ok(());
    }

    app.sign_in_with_oauth(&provider).await?;
    let authorize_url = location.href();

    println!("\nOpening browser to:\n{}\n", authorize_url);
    if let Err(e) = SystemBrowser.assign(&authorize_url) {
        println!("Could not open a browser ({}), open the URL above manually", e);
    }

    println!("Waiting for authorization...");
    let callback_url = callback.wait_for_callback(Duration::from_secs(300)).await?;
    location.replace(&callback_url);

    if !app.call_oauth_callback().await? {
        println!("The callback did not match this sign-in attempt");
        return Ok(());
    }

    println!("\nAuthorization successful!");
    match app.get_user(GetUserOptions::default()).await? {
        Some(user) => println!("Signed in as {}", describe(&user)),
        None => println!("Signed in, but the user could not be loaded"),
    }

    let teams = app.list_teams(None).await?;
    println!("Member of {} team(s)", teams.len());
    for team in teams {
        println!("  - {} ({})", team.display_name, team.id);
    }

    Ok(())
}

fn describe(user: &CurrentUser) -> String {
    match (&user.display_name, &user.primary_email) {
        (Some(name), Some(email)) => format!("{} <{}>", name, email),
        (Some(name), None) => name.clone(),
        (None, Some(email)) => email.clone(),
        (None, None) => user.id.clone(),
    }
}
