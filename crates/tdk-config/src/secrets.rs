//! Runtime secret resolution.
//!
//! Single source of truth for secret handling:
//! - Config YAML stores only env var NAMES (e.g. `"TDK_SMTP_PASSWORD"`).
//! - Callers invoke [`resolve_secrets`] once at startup and pass the result
//!   into constructors; `std::env::var` is never called anywhere else.
//! - `Debug` on [`ResolvedSecrets`] redacts values.
//! - Error messages reference the env var NAME, never the value.
//!
//! The oracle key is required (the pipeline is inert without polling); the
//! model key is required; SMTP credentials are optional (an unauthenticated
//! relay is a valid deployment).

use anyhow::{bail, Result};
use serde_json::Value;

/// All runtime-resolved secrets for one process.
#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Transcript-oracle API key.
    pub oracle_api_key: String,
    /// Language-model provider API key.
    pub model_api_key: String,
    /// SMTP username; `None` when the relay needs no auth.
    pub smtp_username: Option<String>,
    /// SMTP password; `None` when the relay needs no auth.
    pub smtp_password: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("oracle_api_key", &"<REDACTED>")
            .field("model_api_key", &"<REDACTED>")
            .field(
                "smtp_username",
                &self.smtp_username.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "smtp_password",
                &self.smtp_password.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

/// Resolve secrets from the environment using env var names stored in the
/// merged config document under `/secrets/*`.
///
/// Missing name entries fall back to the `TDK_*` defaults so a bare config
/// still resolves against a conventional environment.
pub fn resolve_secrets(config_json: &Value) -> Result<ResolvedSecrets> {
    let oracle_var = name_at(config_json, "/secrets/oracle_api_key_env", "TDK_ORACLE_API_KEY");
    let model_var = name_at(config_json, "/secrets/model_api_key_env", "TDK_MODEL_API_KEY");
    let smtp_user_var = name_at(config_json, "/secrets/smtp_username_env", "TDK_SMTP_USERNAME");
    let smtp_pass_var = name_at(config_json, "/secrets/smtp_password_env", "TDK_SMTP_PASSWORD");

    let oracle_api_key = match read_env(&oracle_var) {
        Some(v) => v,
        None => bail!("required secret env var {oracle_var} is unset or empty"),
    };
    let model_api_key = match read_env(&model_var) {
        Some(v) => v,
        None => bail!("required secret env var {model_var} is unset or empty"),
    };

    Ok(ResolvedSecrets {
        oracle_api_key,
        model_api_key,
        smtp_username: read_env(&smtp_user_var),
        smtp_password: read_env(&smtp_pass_var),
    })
}

fn name_at(v: &Value, ptr: &str, default: &str) -> String {
    v.pointer(ptr)
        .and_then(|x| x.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Empty values count as unset — a `FOO=` line in an env file must not
/// satisfy a required secret.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn debug_redacts_values() {
        let s = ResolvedSecrets {
            oracle_api_key: "oracle-key".to_string(),
            model_api_key: "model-key".to_string(),
            smtp_username: Some("user".to_string()),
            smtp_password: Some("hunter2".to_string()),
        };
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("oracle-key"));
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<REDACTED>"));
    }

    #[test]
    fn custom_env_names_are_honoured() {
        let cfg = json!({"secrets": {"oracle_api_key_env": "CUSTOM_ORACLE_KEY"}});
        std::env::set_var("CUSTOM_ORACLE_KEY", "k1");
        std::env::set_var("TDK_MODEL_API_KEY", "k2");
        let s = resolve_secrets(&cfg).unwrap();
        assert_eq!(s.oracle_api_key, "k1");
        assert_eq!(s.model_api_key, "k2");
        std::env::remove_var("CUSTOM_ORACLE_KEY");
        std::env::remove_var("TDK_MODEL_API_KEY");
    }

    #[test]
    fn missing_required_secret_names_the_var() {
        let cfg = json!({"secrets": {"oracle_api_key_env": "DEFINITELY_UNSET_VAR_X"}});
        let err = resolve_secrets(&cfg).unwrap_err().to_string();
        assert!(err.contains("DEFINITELY_UNSET_VAR_X"));
    }
}
