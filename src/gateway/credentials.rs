/// Short-lived bearer token management for authenticated backends.
///
/// Tokens are minted by an external, pre-authenticated credential helper,
/// cached in memory only, and handed to adapters by value. Nothing here ever
/// touches durable storage.

use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::utils::debug_log_for;

/// Refresh this far ahead of the assumed expiry.
const EXPIRY_SAFETY_BUFFER: Duration = Duration::from_secs(5 * 60);
/// Re-run the helper if the cached token has not been validated this recently.
const REVALIDATE_AFTER: Duration = Duration::from_secs(10 * 60);
/// Conservative lifetime assumed for freshly minted tokens.
const ASSUMED_LIFETIME: Duration = Duration::from_secs(60 * 60);
const MAX_TOKEN_LEN: usize = 4096;

/// Source of bearer tokens, injectable so tests can substitute a fake.
pub trait CredentialSource: Send + Sync {
    /// Current token, minting a fresh one if the cache is stale.
    /// Returns None rather than erroring when no token can be produced.
    fn get_token(&self) -> Option<String>;
    /// Whether the helper reports an active authenticated account.
    fn is_available(&self) -> bool;
    /// Wipe the in-memory token.
    fn clear_token(&self);
}

struct Credential {
    token: String,
    expires_at: Instant,
    validated_at: Instant,
}

impl Credential {
    fn is_current(&self, now: Instant) -> bool {
        let before_expiry_window = self
            .expires_at
            .checked_sub(EXPIRY_SAFETY_BUFFER)
            .is_some_and(|cutoff| now < cutoff);
        before_expiry_window && now.duration_since(self.validated_at) < REVALIDATE_AFTER
    }
}

pub struct CredentialManager {
    /// Helper invocation that prints an active bearer token on stdout.
    helper: Vec<String>,
    /// Helper invocation whose non-empty output means an account is logged in.
    probe: Vec<String>,
    cached: Mutex<Option<Credential>>,
}

impl CredentialManager {
    pub fn new() -> Self {
        Self::with_helper(
            vec![
                "gcloud".to_string(),
                "auth".to_string(),
                "print-access-token".to_string(),
            ],
            vec![
                "gcloud".to_string(),
                "auth".to_string(),
                "list".to_string(),
                "--filter=status:ACTIVE".to_string(),
                "--format=value(account)".to_string(),
            ],
        )
    }

    pub fn with_helper(helper: Vec<String>, probe: Vec<String>) -> Self {
        Self {
            helper,
            probe,
            cached: Mutex::new(None),
        }
    }

    /// Run the helper and validate the token shape. Validation happens here,
    /// strictly before any network use.
    fn mint(&self) -> Option<String> {
        let (bin, args) = self.helper.split_first()?;
        let output = match Command::new(bin).args(args).output() {
            Ok(o) => o,
            Err(e) => {
                debug_log_for("credentials", &format!("helper failed to start: {}", e));
                return None;
            }
        };
        if !output.status.success() {
            debug_log_for(
                "credentials",
                &format!("helper exited with {:?}", output.status.code()),
            );
            return None;
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !is_valid_token(&token) {
            debug_log_for(
                "credentials",
                &format!("helper printed an invalid token ({} bytes)", token.len()),
            );
            return None;
        }
        Some(token)
    }
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialSource for CredentialManager {
    fn get_token(&self) -> Option<String> {
        let now = Instant::now();
        if let Ok(guard) = self.cached.lock() {
            if let Some(cred) = guard.as_ref() {
                if cred.is_current(now) {
                    return Some(cred.token.clone());
                }
            }
        }

        // Lock released during the helper call: a redundant concurrent
        // refresh just overwrites with an equally valid token.
        let token = self.mint()?;
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some(Credential {
                token: token.clone(),
                expires_at: now + ASSUMED_LIFETIME,
                validated_at: now,
            });
        }
        Some(token)
    }

    fn is_available(&self) -> bool {
        let Some((bin, args)) = self.probe.split_first() else {
            return false;
        };
        match Command::new(bin).args(args).output() {
            Ok(output) => {
                output.status.success()
                    && !String::from_utf8_lossy(&output.stdout).trim().is_empty()
            }
            Err(_) => false,
        }
    }

    fn clear_token(&self) {
        if let Ok(mut guard) = self.cached.lock() {
            *guard = None;
        }
    }
}

/// Token shape check: non-empty, bounded length, no embedded whitespace.
fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && !token.chars().any(char::is_whitespace)
}
