//! Login and logout handlers

use std::io::{self, Write};

use anyhow::{Context, Result};

use nebula_core::SyncEngine;

use crate::output::Output;

/// Sign in, prompting for the password when it was not passed
pub async fn login(
    engine: &SyncEngine,
    email: &str,
    password: Option<String>,
    output: &Output,
) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => prompt_password()?,
    };

    let session = engine
        .sign_in(email, &password)
        .await
        .context("Sign-in failed")?;
    output.print_session(&session);
    Ok(())
}

pub async fn logout(engine: &SyncEngine, output: &Output) -> Result<()> {
    // Local state is cleared even when the server call fails
    if let Err(e) = engine.sign_out().await {
        if !output.is_quiet() {
            eprintln!("⚠ Server sign-out failed: {}", e);
        }
    }
    output.success("Signed out");
    Ok(())
}

fn prompt_password() -> Result<String> {
    print!("Password: ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}
