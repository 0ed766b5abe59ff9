//! Human-in-the-loop challenge resolution.
//!
//! Captcha images and SMS codes cannot be answered by the crate itself;
//! callers plug in a [`ChallengeResolver`] wired to whatever they have
//! available (an OCR service, a mail bridge, a UI prompt). The bundled
//! [`StdinChallengeResolver`] covers interactive terminal use and is the
//! default when nothing else is configured.

use std::io::Write;

use async_trait::async_trait;
use tracing::warn;

/// File name used when dropping the captcha image into the temp directory.
const CAPTCHA_FILE: &str = "seu_auth_captcha.jpg";

/// Answers the interactive challenges of the login flow.
///
/// Returning `None` (or blank text) means the challenge cannot be answered;
/// the login aborts instead of burning retries on empty submissions.
#[async_trait]
pub trait ChallengeResolver: Send + Sync {
    /// Produces the text shown in the captcha image.
    async fn solve_captcha(&self, image: &[u8]) -> Option<String>;

    /// Produces the SMS verification code sent to `phone`. `phone` is empty
    /// when the server notice did not reveal the number.
    async fn resolve_sms_code(&self, phone: &str) -> Option<String>;
}

/// Terminal-based resolver: shows where the captcha image landed and reads
/// answers from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinChallengeResolver;

#[async_trait]
impl ChallengeResolver for StdinChallengeResolver {
    async fn solve_captcha(&self, image: &[u8]) -> Option<String> {
        let path = std::env::temp_dir().join(CAPTCHA_FILE);
        if let Err(error) = tokio::fs::write(&path, image).await {
            warn!(%error, "could not write captcha image for display");
            return None;
        }
        println!("Captcha image saved to {}", path.display());
        prompt("Captcha answer: ").await
    }

    async fn resolve_sms_code(&self, phone: &str) -> Option<String> {
        if phone.is_empty() {
            println!("An SMS verification code was sent to your phone.");
        } else {
            println!("An SMS verification code was sent to {phone}.");
        }
        prompt("SMS code: ").await
    }
}

/// Reads one trimmed line from stdin off the async runtime. Empty input
/// and EOF both come back as `None`.
async fn prompt(label: &'static str) -> Option<String> {
    let answer = tokio::task::spawn_blocking(move || {
        print!("{label}");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
    .await;

    match answer {
        Ok(Some(text)) if !text.is_empty() => Some(text),
        Ok(_) => None,
        Err(error) => {
            warn!(%error, "stdin prompt task failed");
            None
        }
    }
}
