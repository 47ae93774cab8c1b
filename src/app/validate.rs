//! Field checks shared by the JSON API and the CSV importer.

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::CrmError;

static PHONE_CHARS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9+()\-.\s]+$").expect("phone regex is a valid static pattern"));

/// Minimum digit count for a phone number to be accepted.
const MIN_PHONE_DIGITS: usize = 8;

pub fn is_valid_email(email: &str) -> bool {
    email.trim().contains('@')
}

/// Loose phone check: only digits and common separators, with at least
/// [`MIN_PHONE_DIGITS`] digits.
pub fn is_loose_phone(phone: &str) -> bool {
    let phone = phone.trim();
    PHONE_CHARS_REGEX.is_match(phone)
        && phone.chars().filter(|c| c.is_ascii_digit()).count() >= MIN_PHONE_DIGITS
}

pub fn require_non_empty(field: &str, value: &str) -> Result<(), CrmError> {
    if value.trim().is_empty() {
        return Err(CrmError::validation(format!("{} is required", field)));
    }
    Ok(())
}

pub fn check_email(email: Option<&str>) -> Result<(), CrmError> {
    match email {
        Some(e) if !e.trim().is_empty() && !is_valid_email(e) => Err(CrmError::validation(
            format!("Invalid email '{}': must contain '@'", e.trim()),
        )),
        _ => Ok(()),
    }
}

pub fn check_phone(phone: Option<&str>) -> Result<(), CrmError> {
    match phone {
        Some(p) if !p.trim().is_empty() && !is_loose_phone(p) => Err(CrmError::validation(
            format!("Invalid phone '{}'", p.trim()),
        )),
        _ => Ok(()),
    }
}

/// Lowercase ASCII slug. Accented Latin letters are folded, runs of other
/// characters collapse into `sep`.
pub fn slugify(input: &str, sep: char) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_sep = false;
    for c in input.trim().chars().flat_map(char::to_lowercase) {
        let folded = match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        };
        if folded.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push(sep);
            }
            pending_sep = false;
            out.push(folded);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Empty or whitespace-only strings become `None`.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_needs_at_sign() {
        assert!(is_valid_email("ana@example.com"));
        assert!(!is_valid_email("ana.example.com"));
        assert!(check_email(None).is_ok());
        assert!(check_email(Some("")).is_ok());
        assert!(check_email(Some("nope")).is_err());
    }

    #[test]
    fn phone_is_loose() {
        assert!(is_loose_phone("(11) 98765-4321"));
        assert!(is_loose_phone("+55 11 3333.4444"));
        assert!(!is_loose_phone("1234"));
        assert!(!is_loose_phone("11 9876-ABCD"));
    }

    #[test]
    fn slugify_folds_accents() {
        assert_eq!(slugify("Negociação Final", '_'), "negociacao_final");
        assert_eq!(slugify("  Acme & Filhos Ltda. ", '-'), "acme-filhos-ltda");
        assert_eq!(slugify("***", '-'), "");
    }

    #[test]
    fn non_blank_trims() {
        assert_eq!(non_blank(Some("  x ".into())), Some("x".into()));
        assert_eq!(non_blank(Some("   ".into())), None);
        assert_eq!(non_blank(None), None);
    }
}
