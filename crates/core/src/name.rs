//! Command-name resolution.
//!
//! Handlers are looked up by a short canonical name. The convention: take the
//! command type's bare name, strip a trailing `Command`, and convert
//! CamelCase to lowercase snake_case (`SendEmailCommand` -> `send_email`).
//! An explicit override on the type wins verbatim. Resolution is cached per
//! type for the life of the process.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed command definition.
///
/// Implement this on the input type of a command to get a canonical name and
/// serde-backed input plumbing at the registry and enqueue boundaries:
///
/// ```
/// use anvil_core::CommandDefinition;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct SendEmailCommand {
///     to: String,
/// }
///
/// impl CommandDefinition for SendEmailCommand {}
///
/// assert_eq!(SendEmailCommand::command_name(), "send_email");
/// ```
pub trait CommandDefinition: Serialize + DeserializeOwned + Send + 'static {
    /// Explicit name override; `None` means derive by convention.
    const NAME: Option<&'static str> = None;

    /// Canonical name used for routing and persistence.
    fn command_name() -> &'static str
    where
        Self: Sized,
    {
        resolved::<Self>(Self::NAME)
    }
}

/// Resolve (and cache) the canonical name for type `T`.
pub fn resolved<T: 'static>(explicit: Option<&'static str>) -> &'static str {
    if let Some(name) = explicit {
        return name;
    }

    static CACHE: OnceLock<RwLock<HashMap<TypeId, &'static str>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    let key = TypeId::of::<T>();
    if let Some(name) = cache.read().expect("name cache poisoned").get(&key).copied() {
        return name;
    }

    let derived: &'static str =
        Box::leak(derive_command_name(std::any::type_name::<T>()).into_boxed_str());
    cache
        .write()
        .expect("name cache poisoned")
        .insert(key, derived);
    derived
}

/// Derive a canonical name from a (possibly fully-qualified) type name.
pub fn derive_command_name(type_name: &str) -> String {
    // Drop generic arguments, then the module path.
    let bare = type_name.split('<').next().unwrap_or(type_name);
    let bare = bare.rsplit("::").next().unwrap_or(bare);

    let stem = match bare.strip_suffix("Command") {
        Some(s) if !s.is_empty() => s,
        _ => bare,
    };

    let mut out = String::with_capacity(stem.len() + 4);
    for (i, ch) in stem.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn strips_suffix_and_snake_cases() {
        assert_eq!(derive_command_name("SendEmailCommand"), "send_email");
        assert_eq!(derive_command_name("ProcessOrderCommand"), "process_order");
        assert_eq!(derive_command_name("app::commands::ApiCallCommand"), "api_call");
    }

    #[test]
    fn keeps_name_without_suffix() {
        assert_eq!(derive_command_name("Reindex"), "reindex");
        assert_eq!(derive_command_name("SyncLedger"), "sync_ledger");
    }

    #[test]
    fn bare_suffix_is_not_stripped_to_empty() {
        assert_eq!(derive_command_name("Command"), "command");
    }

    #[test]
    fn override_wins_verbatim() {
        #[derive(Serialize, Deserialize)]
        struct Renamed;
        impl CommandDefinition for Renamed {
            const NAME: Option<&'static str> = Some("legacy.v2");
        }
        assert_eq!(Renamed::command_name(), "legacy.v2");
    }

    #[test]
    fn resolution_is_stable_across_calls() {
        #[derive(Serialize, Deserialize)]
        struct RebuildIndexCommand;
        impl CommandDefinition for RebuildIndexCommand {}

        let first = RebuildIndexCommand::command_name();
        let second = RebuildIndexCommand::command_name();
        assert_eq!(first, "rebuild_index");
        // Cached: identical pointer, not just identical text.
        assert!(std::ptr::eq(first, second));
    }
}
