/// One-shot patcher for the iTerm2 preferences plist.
///
/// Installs a bell trigger in every profile: on BEL, set the tab color red
/// via injected escape codes. The daemon (unbell-daemon) clears the color
/// again when the tab regains focus. Run once; restart iTerm2 afterward
/// for the triggers to take effect.
use std::path::PathBuf;

use anyhow::{Context, Result};
use plist::{Dictionary, Value};

/// Trigger action installed by this tool.
const TRIGGER_ACTION: &str = "iTermInjectTrigger";
/// Actions of bell triggers from earlier installs that must be removed
/// before appending the current one (older versions used an RPC trigger).
const STALE_ACTIONS: [&str; 2] = ["iTermInjectTrigger", "iTermRPCTrigger"];
/// The BEL control character, as iTerm2 spells it in a trigger regex.
const BELL_REGEX: &str = r"\a";
/// Escape payload: tab color red (220, 40, 40) via OSC 6.
const TRIGGER_PARAMETER: &str = concat!(
    r"\e]6;1;bg;red;brightness;220\e\\",
    r"\e]6;1;bg;green;brightness;40\e\\",
    r"\e]6;1;bg;blue;brightness;40\e\\",
);

const PLIST_RELATIVE_PATH: &str = "Library/Preferences/com.googlecode.iterm2.plist";
const PROFILES_KEY: &str = "New Bookmarks";
const TRIGGERS_KEY: &str = "Triggers";

fn plist_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(PLIST_RELATIVE_PATH))
}

/// The trigger record this tool installs.
fn bell_trigger() -> Dictionary {
    let mut trigger = Dictionary::new();
    trigger.insert("action".into(), Value::String(TRIGGER_ACTION.into()));
    trigger.insert("regex".into(), Value::String(BELL_REGEX.into()));
    trigger.insert("partial".into(), Value::Boolean(true));
    trigger.insert("parameter".into(), Value::String(TRIGGER_PARAMETER.into()));
    trigger
}

/// Matches bell triggers installed by this tool or its predecessors.
/// User-defined triggers, whatever their regex, never match.
fn is_stale_bell_trigger(trigger: &Value) -> bool {
    let Some(dict) = trigger.as_dictionary() else {
        return false;
    };
    let regex = dict.get("regex").and_then(Value::as_string);
    let action = dict.get("action").and_then(Value::as_string);
    regex == Some(BELL_REGEX) && action.is_some_and(|a| STALE_ACTIONS.contains(&a))
}

/// Rewrites the trigger list of every profile: stale bell triggers out,
/// exactly one current bell trigger appended. Returns the number of
/// profiles touched. Applying this twice yields the same trigger list as
/// applying it once.
fn patch_profiles(root: &mut Dictionary) -> usize {
    let Some(Value::Array(profiles)) = root.get_mut(PROFILES_KEY) else {
        return 0;
    };

    let mut updated = 0;
    for profile in profiles.iter_mut() {
        let Some(profile) = profile.as_dictionary_mut() else {
            continue;
        };
        let mut triggers = match profile.remove(TRIGGERS_KEY) {
            Some(Value::Array(triggers)) => triggers,
            _ => Vec::new(),
        };
        triggers.retain(|t| !is_stale_bell_trigger(t));
        triggers.push(Value::Dictionary(bell_trigger()));
        profile.insert(TRIGGERS_KEY.into(), Value::Array(triggers));
        updated += 1;
    }
    updated
}

fn main() -> Result<()> {
    let path = plist_path()?;

    let mut plist = Value::from_file(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let root = plist
        .as_dictionary_mut()
        .context("Preferences plist top level is not a dictionary")?;

    let updated = patch_profiles(root);

    plist
        .to_file_binary(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Trigger added to {updated} profiles.");
    println!("Restart iTerm2 for changes to take effect.");
    Ok(())
}
