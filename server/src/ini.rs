// SPDX-License-Identifier: MPL-2.0

//! A minimal INI reader/writer.
//!
//! Handles exactly the subset both the server config and the persisted
//! `cluster.info` file use: `[section]` headers, `key = value` items,
//! `#` comments, and blank lines.

use std::fmt::Write as _;

use crate::prelude::*;

#[derive(Debug, Default)]
pub struct IniSection {
    pub name: String,
    items: Vec<(String, String)>,
}

impl IniSection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_int<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            _ => default,
        }
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        match self.items.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.items.push((key.to_string(), value.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct IniDocument {
    sections: Vec<IniSection>,
}

impl IniDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut doc = Self::new();
        // Items before any header land in an unnamed section.
        let mut current = IniSection::new("");
        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let Some(name) = name.strip_suffix(']') else {
                    return_errno_with_message!(Errno::EINVAL, "unterminated section header");
                };
                doc.sections.push(current);
                current = IniSection::new(name.trim());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return_errno_with_message!(Errno::EINVAL, "expect key = value item");
            };
            current.set(key.trim(), value.trim());
        }
        doc.sections.push(current);
        Ok(doc)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn sections(&self) -> impl Iterator<Item = &IniSection> {
        self.sections.iter().filter(|s| !s.name.is_empty() || !s.items.is_empty())
    }

    pub fn push_section(&mut self, section: IniSection) {
        self.sections.push(section);
    }

    pub fn emit(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if section.name.is_empty() && section.items.is_empty() {
                continue;
            }
            if !section.name.is_empty() {
                let _ = writeln!(out, "[{}]", section.name);
            }
            for (k, v) in &section.items {
                let _ = writeln!(out, "{} = {}", k, v);
            }
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.emit())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let text = "# comment\n[server-1]\nis_master = 1\nstatus = 23\n\n[server-2]\nstatus = 0\n";
        let doc = IniDocument::parse(text).unwrap();
        let s1 = doc.section("server-1").unwrap();
        assert!(s1.get_bool("is_master", false));
        assert_eq!(s1.get_int::<i32>("status", -1), 23);
        let s2 = doc.section("server-2").unwrap();
        assert_eq!(s2.get_int::<i64>("status", -1), 0);
        assert_eq!(s2.get("missing"), None);

        let reparsed = IniDocument::parse(&doc.emit()).unwrap();
        assert_eq!(
            reparsed.section("server-1").unwrap().get("status"),
            Some("23")
        );
    }

    #[test]
    fn malformed_lines_fail() {
        assert!(IniDocument::parse("[unterminated\n").is_err());
        assert!(IniDocument::parse("no equal sign\n").is_err());
    }
}
