use crate::RenderError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Transliterate a single Cyrillic character to its Latin equivalent.
///
/// Cache keys routinely contain group names like `"Бакалавр_1-курс"`; the
/// output file name must stay filesystem-safe and ASCII-only.
fn transliterate(c: char) -> Option<&'static str> {
    let out = match c {
        'А' => "A",
        'Б' => "B",
        'В' => "V",
        'Г' => "G",
        'Д' => "D",
        'Е' => "E",
        'Ё' => "Yo",
        'Ж' => "Zh",
        'З' => "Z",
        'И' => "I",
        'Й' => "Y",
        'К' => "K",
        'Л' => "L",
        'М' => "M",
        'Н' => "N",
        'О' => "O",
        'П' => "P",
        'Р' => "R",
        'С' => "S",
        'Т' => "T",
        'У' => "U",
        'Ф' => "F",
        'Х' => "Kh",
        'Ц' => "Ts",
        'Ч' => "Ch",
        'Ш' => "Sh",
        'Щ' => "Shch",
        'Ъ' => "",
        'Ы' => "Y",
        'Ь' => "",
        'Э' => "E",
        'Ю' => "Yu",
        'Я' => "Ya",
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' => "e",
        'ё' => "yo",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "kh",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "shch",
        'ъ' => "",
        'ы' => "y",
        'ь' => "",
        'э' => "e",
        'ю' => "yu",
        'я' => "ya",
        _ => return None,
    };
    Some(out)
}

/// Make a cache key safe to use as a file name: path separators become
/// underscores, Cyrillic is transliterated, and anything else outside
/// `[a-zA-Z0-9_-]` collapses to an underscore.
pub fn sanitize_cache_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());

    for c in key.chars() {
        match c {
            '/' | '\\' | ':' => out.push('_'),
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => out.push(c),
            c => match transliterate(c) {
                Some(latin) => out.push_str(latin),
                None => out.push('_'),
            },
        }
    }

    out
}

/// Output file naming contract: `{transliterated-cache-key}-{unix-millis}.jpeg`.
pub fn capture_filename(cache_key: &str) -> String {
    capture_filename_at(cache_key, unix_millis_now())
}

pub fn capture_filename_at(cache_key: &str, unix_millis: u128) -> String {
    format!("{}-{}.jpeg", sanitize_cache_key(cache_key), unix_millis)
}

pub fn unix_millis_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

pub fn validate_url(url: &str) -> Result<Url, RenderError> {
    let parsed = Url::parse(url).map_err(|e| RenderError::InvalidUrl(format!("{url}: {e}")))?;

    // Only page URLs make sense for a render
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(RenderError::InvalidUrl(format!(
            "unsupported scheme '{other}'"
        ))),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

/// Human-readable age of a cache entry, e.g. "4h 59m".
pub fn format_age(age: Duration) -> String {
    let hours = age.as_secs() / 3600;
    let minutes = (age.as_secs() % 3600) / 60;
    format!("{hours}h {minutes}m")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_plain_keys() {
        assert_eq!(
            sanitize_cache_key("bakalavr_1-kurs_101-21"),
            "bakalavr_1-kurs_101-21"
        );
        assert_eq!(sanitize_cache_key("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_cache_key("key with spaces"), "key_with_spaces");
    }

    #[test]
    fn test_sanitize_transliterates_cyrillic() {
        assert_eq!(sanitize_cache_key("Бакалавр"), "Bakalavr");
        assert_eq!(sanitize_cache_key("1-курс"), "1-kurs");
        assert_eq!(sanitize_cache_key("Щи/ёж"), "Shchi_yozh");
        // Hard/soft signs disappear entirely
        assert_eq!(sanitize_cache_key("объём"), "obyom");
    }

    #[test]
    fn test_capture_filename_contract() {
        assert_eq!(
            capture_filename_at("Бакалавр_101", 1700000000000),
            "Bakalavr_101-1700000000000.jpeg"
        );
        let name = capture_filename("group-1");
        assert!(name.starts_with("group-1-"));
        assert!(name.ends_with(".jpeg"));
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com/schedule?group=101").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::from_secs(4 * 3600 + 59 * 60)), "4h 59m");
        assert_eq!(format_age(Duration::from_secs(30)), "0h 0m");
    }
}
