// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::Mutex;

/// Process-wide string key/value store, exposed to services through the
/// GETENV/SETENV commands. The table is small and read rarely, so a linear
/// scan under one lock is all it needs.
pub struct Env {
    values: Mutex<Vec<(String, String)>>,
}

impl Env {
    pub fn new() -> Env {
        Env {
            values: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().expect("env lock poisoned");
        values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or overwrite.
    pub fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock().expect("env lock poisoned");
        match values.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => values.push((key.to_string(), value.to_string())),
        }
    }

    /// Read-through default: a missing key is stored with `default` so every
    /// later reader observes the same value.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        let mut values = self.values.lock().expect("env lock poisoned");
        if let Some((_, v)) = values.iter().find(|(k, _)| k == key) {
            return v.clone();
        }
        values.push((key.to_string(), default.to_string()));
        default.to_string()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_overwrite() {
        let env = Env::new();
        assert_eq!(env.get("thread"), None);

        env.set("thread", "8");
        assert_eq!(env.get("thread").as_deref(), Some("8"));

        env.set("thread", "4");
        assert_eq!(env.get("thread").as_deref(), Some("4"));
    }

    #[test]
    fn read_through_default_sticks() {
        let env = Env::new();
        assert_eq!(env.get_or("harbor", "1"), "1");
        // The default was stored, not just returned:
        assert_eq!(env.get("harbor").as_deref(), Some("1"));
        assert_eq!(env.get_or("harbor", "2"), "1");
    }
}
