//! 24-hour cache keyed by UTC date + lookup key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};

type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// An entry is valid only on the UTC day it was stored.
pub struct DailyCache<T> {
    entries: Mutex<HashMap<String, (NaiveDate, T)>>,
    today: Clock,
}

impl<T: Clone> DailyCache<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(|| Utc::now().date_naive()))
    }

    pub fn with_clock(today: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            today,
        }
    }

    pub fn today(&self) -> NaiveDate {
        (self.today)()
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let today = self.today();
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((date, value)) if *date == today => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: T) {
        let today = self.today();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), (today, value));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for DailyCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
