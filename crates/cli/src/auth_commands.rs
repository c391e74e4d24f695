use {
    anyhow::{Result, bail},
    clap::Subcommand,
    secrecy::ExposeSecret,
    wagate_gateway::auth::{TokenSigner, hash_password},
};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Print an argon2 hash suitable for `auth.password`.
    HashPassword {
        #[arg(long, env = "WAGATE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Issue an access token signed with the configured `auth.jwt_secret`.
    Token {
        #[arg(long, default_value = "admin")]
        subject: String,
    },
}

pub fn handle_auth(action: AuthAction) -> Result<()> {
    match action {
        AuthAction::HashPassword { password } => {
            if password.is_empty() {
                bail!("password must not be empty");
            }
            println!("{}", hash_password(&password)?);
            Ok(())
        },
        AuthAction::Token { subject } => {
            let config = wagate_config::discover_and_load();
            let Some(secret) = config.auth.jwt_secret.as_ref() else {
                bail!("auth.jwt_secret is not configured; a running gateway would not accept this token");
            };
            let signer = TokenSigner::new(secret.expose_secret().as_bytes(), config.auth.token_ttl());
            let issued = signer.issue(&subject)?;
            println!("{}", serde_json::to_string_pretty(&issued)?);
            Ok(())
        },
    }
}
