pub mod crypto;
pub mod shell;

pub use shell::{CommandOutput, CommandSpec, ShellGuard, SubprocessRunner, find_executable};

/// Masks the password of a URL so it can be logged.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

/// `true` when `raw` looks like `scheme://...` rather than a filesystem path.
pub fn looks_like_url(raw: &str) -> bool {
    url::Url::parse(raw).is_ok_and(|u| u.scheme().len() > 1 && raw.contains("://"))
}
