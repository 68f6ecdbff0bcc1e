//! Exported session info.
//!
//! A compact, single-line description of a session's decided policy that
//! one process hands to another out of band, so the second can create a
//! matching non-negotiated session:
//!
//! ```text
//! [Integrity="YES";Encryption="NO";CryptoMethods="CHACHA20";SessionExpires=1767225600;ValidCommands="60008,421";ShortVersion="0.1.0";]
//! ```
//!
//! Values never contain `;`. Crypto method lists use `.` as the delimiter
//! because the string is embedded in places where `,` is significant.

use crate::error::{Result, SecManError};
use crate::protocol::{attr, AttrValue, NegotiationRecord};

/// Attributes carried verbatim
const EXPORTED: &[&str] = &[
    attr::INTEGRITY,
    attr::ENCRYPTION,
    attr::SESSION_EXPIRES,
    attr::VALID_COMMANDS,
];

/// Render the exportable part of a decided policy.
pub fn export_session_info(policy: &NegotiationRecord) -> Result<String> {
    let mut exported = policy.project(EXPORTED);

    if let Some(methods) = policy.get_list(attr::CRYPTO_METHODS) {
        if let Some(first) = methods.first() {
            exported.set(attr::CRYPTO_METHODS, first.as_str());
        }
        if methods.len() > 1 {
            exported.set(attr::CRYPTO_METHODS_LIST, methods.join("."));
        }
    }

    if let Some(short) = policy.get_str(attr::REMOTE_VERSION).and_then(short_version) {
        exported.set(attr::SHORT_VERSION, short);
    }

    let mut out = String::from("[");
    for (name, value) in exported.iter() {
        let rendered = match value {
            AttrValue::Str(s) => format!("\"{s}\""),
            other => other.to_string(),
        };
        if rendered.contains(';') {
            return Err(SecManError::Protocol(format!(
                "cannot export {name}: value contains ';'"
            )));
        }
        out.push_str(name);
        out.push('=');
        out.push_str(&rendered);
        out.push(';');
    }
    out.push(']');
    Ok(out)
}

/// Merge exported session info into `policy`. Only the exported attributes
/// are taken; anything else in `text` is ignored. Empty input is a no-op.
pub fn import_session_info(text: &str, policy: &mut NegotiationRecord) -> Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    let body = text
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| SecManError::Protocol(format!("invalid session info: {text}")))?;

    let mut imported = NegotiationRecord::new();
    for item in body.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| SecManError::Protocol(format!("invalid session info item: {item}")))?;
        imported.set(name.trim(), parse_value(value.trim())?);
    }

    for name in [
        attr::INTEGRITY,
        attr::ENCRYPTION,
        attr::CRYPTO_METHODS,
        attr::SESSION_EXPIRES,
        attr::VALID_COMMANDS,
    ] {
        policy.copy_from(&imported, name);
    }
    // the full list wins over the single legacy method
    policy.copy_as(attr::CRYPTO_METHODS, &imported, attr::CRYPTO_METHODS_LIST);
    if let Some(methods) = policy.get_str(attr::CRYPTO_METHODS) {
        let methods = methods.replace('.', ",");
        policy.set(attr::CRYPTO_METHODS, methods);
    }

    if let Some(short) = imported.get_str(attr::SHORT_VERSION) {
        policy.set(attr::REMOTE_VERSION, format!("$SecMan: {short} $"));
    }
    Ok(())
}

fn parse_value(raw: &str) -> Result<AttrValue> {
    if let Some(s) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Ok(AttrValue::Str(s.to_string()));
    }
    if raw.eq_ignore_ascii_case("true") {
        return Ok(AttrValue::Bool(true));
    }
    if raw.eq_ignore_ascii_case("false") {
        return Ok(AttrValue::Bool(false));
    }
    raw.parse::<i64>()
        .map(AttrValue::Int)
        .map_err(|_| SecManError::Protocol(format!("invalid session info value: {raw}")))
}

/// `"$SecMan: 1.2.3 $"` → `"1.2.3"`
fn short_version(full: &str) -> Option<String> {
    full.split_whitespace()
        .find(|word| word.starts_with(|c: char| c.is_ascii_digit()))
        .map(|word| {
            word.split('.')
                .map(|part| {
                    part.chars()
                        .take_while(char::is_ascii_digit)
                        .collect::<String>()
                })
                .take(3)
                .collect::<Vec<_>>()
                .join(".")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decided() -> NegotiationRecord {
        let mut policy = NegotiationRecord::new();
        policy.set(attr::AUTHENTICATION, "YES");
        policy.set(attr::INTEGRITY, "YES");
        policy.set(attr::ENCRYPTION, "NO");
        policy.set(attr::CRYPTO_METHODS, "CHACHA20,AES");
        policy.set(attr::SESSION_EXPIRES, 1_767_225_600i64);
        policy.set(attr::VALID_COMMANDS, "60008,421");
        policy.set(attr::REMOTE_VERSION, "$SecMan: 0.3.1 $");
        policy
    }

    #[test]
    fn test_export_format() {
        let text = export_session_info(&decided()).unwrap();
        assert_eq!(
            text,
            "[Integrity=\"YES\";Encryption=\"NO\";SessionExpires=1767225600;\
             ValidCommands=\"60008,421\";CryptoMethods=\"CHACHA20\";\
             CryptoMethodsList=\"CHACHA20.AES\";ShortVersion=\"0.3.1\";]"
        );
        assert!(!text.contains("Authentication"));
    }

    #[test]
    fn test_import_restores_methods_and_version() {
        let text = export_session_info(&decided()).unwrap();
        let mut policy = NegotiationRecord::new();
        policy.set(attr::ENCRYPTION, "YES");
        import_session_info(&text, &mut policy).unwrap();

        assert_eq!(policy.get_str(attr::ENCRYPTION), Some("NO"));
        assert_eq!(policy.get_str(attr::CRYPTO_METHODS), Some("CHACHA20,AES"));
        assert_eq!(policy.get_int(attr::SESSION_EXPIRES), Some(1_767_225_600));
        assert_eq!(policy.get_str(attr::REMOTE_VERSION), Some("$SecMan: 0.3.1 $"));
        assert!(!policy.contains(attr::SHORT_VERSION));
    }

    #[test]
    fn test_import_empty_is_noop() {
        let mut policy = NegotiationRecord::new();
        import_session_info("", &mut policy).unwrap();
        assert!(policy.is_empty());
    }

    #[test]
    fn test_import_rejects_malformed() {
        let mut policy = NegotiationRecord::new();
        assert!(import_session_info("Integrity=\"YES\"", &mut policy).is_err());
        assert!(import_session_info("[Integrity]", &mut policy).is_err());
        assert!(import_session_info("[Integrity=YES]", &mut policy).is_err());
    }

    #[test]
    fn test_short_version() {
        assert_eq!(short_version("$SecMan: 0.1.0 $").as_deref(), Some("0.1.0"));
        assert_eq!(short_version("garbage"), None);
    }
}
