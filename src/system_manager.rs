// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! System manager (component J): process-wide key→blob stores. Three
//! sub-stores: persistent (world-lifetime), temporary (frame-lifetime,
//! cleared by `clear_frame`), and per-system settings (a named-blob list
//! keyed by system name).
//!
//! Keys are ASCII strings rather than typed handles, modeled as explicit
//! handles passed through the world with no implicit singletons —
//! there is no static/global registry here, only a struct the world owns
//! and passes to whatever needs it.

use ahash::AHashMap;

use crate::error::{EcsError, Result};

fn missing(key: &str) -> EcsError {
    EcsError::NamedSharedInstanceMissing(format!("system_manager key '{key}'"))
}

/// Process-wide key→blob stores.
#[derive(Default)]
pub struct SystemManager {
    persistent: AHashMap<String, Vec<u8>>,
    temporary: AHashMap<String, Vec<u8>>,
    settings: AHashMap<String, AHashMap<String, Vec<u8>>>,
}

impl SystemManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_persistent(&mut self, key: &str, data: Vec<u8>) {
        self.persistent.insert(key.to_string(), data);
    }

    /// Looks up a persistent value. Crashes with a formatted error on a
    /// miss ("misses crash... unless the try_* variant").
    pub fn get_persistent(&self, key: &str) -> &[u8] {
        match self.try_get_persistent(key) {
            Some(data) => data,
            None => crate::error::fatal(missing(key), crate::debug_info!()),
        }
    }

    pub fn try_get_persistent(&self, key: &str) -> Option<&[u8]> {
        self.persistent.get(key).map(|v| v.as_slice())
    }

    pub fn remove_persistent(&mut self, key: &str) -> Result<()> {
        self.persistent.remove(key).map(|_| ()).ok_or_else(|| missing(key))
    }

    pub fn set_temporary(&mut self, key: &str, data: Vec<u8>) {
        self.temporary.insert(key.to_string(), data);
    }

    pub fn get_temporary(&self, key: &str) -> &[u8] {
        match self.try_get_temporary(key) {
            Some(data) => data,
            None => crate::error::fatal(missing(key), crate::debug_info!()),
        }
    }

    pub fn try_get_temporary(&self, key: &str) -> Option<&[u8]> {
        self.temporary.get(key).map(|v| v.as_slice())
    }

    /// Clears every temporary value, called at the frame boundary.
    pub fn clear_frame(&mut self) {
        self.temporary.clear();
    }

    pub fn set_setting(&mut self, system: &str, key: &str, data: Vec<u8>) {
        self.settings.entry(system.to_string()).or_default().insert(key.to_string(), data);
    }

    pub fn get_setting(&self, system: &str, key: &str) -> &[u8] {
        match self.try_get_setting(system, key) {
            Some(data) => data,
            None => crate::error::fatal(missing(key), crate::debug_info!()),
        }
    }

    pub fn try_get_setting(&self, system: &str, key: &str) -> Option<&[u8]> {
        self.settings.get(system)?.get(key).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistent_round_trips() {
        let mut sm = SystemManager::new();
        sm.set_persistent("score", vec![1, 2, 3]);
        assert_eq!(sm.get_persistent("score"), &[1, 2, 3]);
    }

    #[test]
    fn try_get_missing_returns_none() {
        let sm = SystemManager::new();
        assert_eq!(sm.try_get_persistent("nope"), None);
    }

    #[test]
    fn clear_frame_wipes_only_temporary() {
        let mut sm = SystemManager::new();
        sm.set_persistent("a", vec![1]);
        sm.set_temporary("b", vec![2]);
        sm.clear_frame();
        assert!(sm.try_get_temporary("b").is_none());
        assert_eq!(sm.try_get_persistent("a"), Some(&[1][..]));
    }

    #[test]
    fn settings_are_scoped_per_system() {
        let mut sm = SystemManager::new();
        sm.set_setting("physics", "gravity", vec![9, 8]);
        sm.set_setting("render", "gravity", vec![0]);
        assert_eq!(sm.try_get_setting("physics", "gravity"), Some(&[9, 8][..]));
        assert_eq!(sm.try_get_setting("render", "gravity"), Some(&[0][..]));
    }

    #[test]
    #[should_panic]
    fn get_persistent_panics_on_miss() {
        let sm = SystemManager::new();
        sm.get_persistent("missing");
    }
}
