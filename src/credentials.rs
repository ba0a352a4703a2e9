//! Temporary account credentials.

use crate::error::BenchError;
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::debug;

/// Alphabet for generated local parts; avoids characters that are easy to
/// confuse when reading addresses from logs.
const USERNAME_ALPHABET: &[u8] = b"2345789acdefghjkmnpqrstuvwxyz";
const USERNAME_RANDOM_LEN: usize = 6;

/// Address and password for one account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    #[serde(rename = "email")]
    pub addr: String,
    pub password: String,
}

/// Where temporary credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Generate `ci-xxxxxx@domain` with a password derived from the local part.
    ChatmailDomain(String),
    /// POST to an endpoint that answers with `{"email": .., "password": ..}`.
    TempEmailUrl(String),
}

impl CredentialSource {
    /// Pick a source from the configured options; the URL wins when both are set.
    pub fn from_options(domain: Option<&str>, tmp_email_url: Option<&str>) -> Result<Self> {
        match (tmp_email_url, domain) {
            (Some(url), _) if !url.is_empty() => Ok(Self::TempEmailUrl(url.to_string())),
            (_, Some(domain)) if !domain.is_empty() => Ok(Self::ChatmailDomain(domain.to_string())),
            _ => Err(BenchError::MissingCredentialSource.into()),
        }
    }

    /// Produce fresh credentials for one account.
    pub async fn obtain(&self) -> Result<Credentials> {
        match self {
            Self::ChatmailDomain(domain) => Ok(generate_credentials(domain)),
            Self::TempEmailUrl(url) => fetch_credentials(url).await,
        }
    }
}

/// Random local part against `domain`; password is `<local>$<local>`.
pub fn generate_credentials(domain: &str) -> Credentials {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..USERNAME_RANDOM_LEN)
        .filter_map(|_| USERNAME_ALPHABET.choose(&mut rng))
        .map(|&b| b as char)
        .collect();
    let username = format!("ci-{}", suffix);
    Credentials {
        addr: format!("{}@{}", username, domain),
        password: format!("{}${}", username, username),
    }
}

async fn fetch_credentials(url: &str) -> Result<Credentials> {
    debug!("Requesting temporary account from {}", url);
    let response = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| format!("Failed to request temporary account from {}", url))?
        .error_for_status()?;
    let credentials = response
        .json::<Credentials>()
        .await
        .context("Temporary account response is not valid JSON credentials")?;
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_credentials_shape() {
        let creds = generate_credentials("example.org");
        let (local, domain) = creds.addr.split_once('@').unwrap();
        assert_eq!(domain, "example.org");
        assert!(local.starts_with("ci-"));
        assert_eq!(local.len(), 3 + USERNAME_RANDOM_LEN);
        assert!(local[3..].bytes().all(|b| USERNAME_ALPHABET.contains(&b)));
        assert_eq!(creds.password, format!("{}${}", local, local));
    }

    #[test]
    fn test_generated_addresses_differ() {
        let a = generate_credentials("example.org");
        let b = generate_credentials("example.org");
        let c = generate_credentials("example.org");
        assert!(a.addr != b.addr || b.addr != c.addr);
    }

    #[test]
    fn test_source_selection() {
        assert_eq!(
            CredentialSource::from_options(Some("example.org"), None).unwrap(),
            CredentialSource::ChatmailDomain("example.org".to_string())
        );
        assert_eq!(
            CredentialSource::from_options(Some("example.org"), Some("https://tmp.example/new")).unwrap(),
            CredentialSource::TempEmailUrl("https://tmp.example/new".to_string())
        );
        let err = CredentialSource::from_options(None, Some("")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::MissingCredentialSource)
        ));
    }

    #[test]
    fn test_credentials_response_parsing() {
        let creds: Credentials =
            serde_json::from_str(r#"{"email":"x@y.org","password":"pw"}"#).unwrap();
        assert_eq!(creds.addr, "x@y.org");
        assert_eq!(creds.password, "pw");
    }

    #[tokio::test]
    async fn test_domain_source_obtains_without_network() {
        let source = CredentialSource::ChatmailDomain("loopback.invalid".to_string());
        let creds = source.obtain().await.unwrap();
        assert!(creds.addr.ends_with("@loopback.invalid"));
    }
}
