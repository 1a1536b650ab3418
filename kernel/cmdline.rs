//! Kernel command line
//!
//! Space-separated `key=value` words (bare words get an empty value),
//! recorded once at boot. `init=` and `root=` are the arguments the
//! boot path consults.

use alloc::string::String;
use alloc::vec::Vec;

use spin::RwLock;

static ARGS: RwLock<Vec<(String, String)>> = RwLock::new(Vec::new());

/// Record the boot command line.
pub fn parse(raw: &str) {
    let mut args = ARGS.write();
    args.clear();
    for word in raw.split_whitespace() {
        match word.split_once('=') {
            Some((key, value)) => args.push((String::from(key), String::from(value))),
            None => args.push((String::from(word), String::new())),
        }
    }
}

/// Value of `key`, if the command line set one.
pub fn get(key: &str) -> Option<String> {
    ARGS.read()
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Whether a bare flag was present.
pub fn has_flag(key: &str) -> bool {
    ARGS.read().iter().any(|(k, _)| k == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_and_pairs_parse() {
        parse("init=/sbin/init quiet root=ramdev0");
        assert_eq!(get("init").as_deref(), Some("/sbin/init"));
        assert_eq!(get("root").as_deref(), Some("ramdev0"));
        assert!(has_flag("quiet"));
        assert!(get("missing").is_none());
    }
}
