use std::{collections::HashMap, sync::Mutex};

/// Hands out unique symbol names. Shared by every group lowered in one
/// compilation, possibly from several threads.
#[derive(Debug, Default)]
pub struct NameGenerator {
    counters: Mutex<HashMap<String, usize>>,
}

impl NameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `hint` the first time it is requested, `hint_1`, `hint_2`, ... after.
    pub fn new_name(&self, hint: &str) -> String {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let n = counters.entry(hint.to_string()).or_insert(0);
        let name = match *n {
            0 => hint.to_string(),
            k => format!("{hint}_{k}"),
        };
        *n += 1;
        name
    }
}
