//! Process-wide interned stat names.
//!
//! A `StatName` is a `Copy` handle into a global table of leaked strings.
//! Interning happens once per distinct string; after that, comparing and
//! hashing names is an integer operation. Index 0 is always `"None"`.
//!
//! Names may be plain (`"Tick"`) or "long": carrying group, description and
//! category alongside the short name, in the form
//! `//GROUP//SHORT///DESCRIPTION///####CATEGORY####`. The helpers at the
//! bottom of this module build and take apart that form.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};

struct NameTable {
    names: Vec<&'static str>,
    lookup: HashMap<&'static str, u32>,
}

impl NameTable {
    fn new() -> Self {
        let mut table = Self {
            names: Vec::new(),
            lookup: HashMap::new(),
        };
        table.intern("None");
        table
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&index) = self.lookup.get(s) {
            return index;
        }
        let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
        let index = self.names.len() as u32;
        self.names.push(leaked);
        self.lookup.insert(leaked, index);
        index
    }
}

static NAMES: OnceLock<Mutex<NameTable>> = OnceLock::new();

fn names() -> &'static Mutex<NameTable> {
    NAMES.get_or_init(|| Mutex::new(NameTable::new()))
}

/// Interned stat name.
///
/// Equality and hashing use the table index. Ordering compares the strings,
/// so sorted output is stable across processes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatName(u32);

impl StatName {
    pub const NONE: StatName = StatName(0);

    pub fn new(s: &str) -> Self {
        let index = names().lock().unwrap_or_else(|e| e.into_inner()).intern(s);
        StatName(index)
    }

    /// Look up an already-interned index.
    pub fn from_index(index: u32) -> Option<Self> {
        let table = names().lock().unwrap_or_else(|e| e.into_inner());
        (index < table.names.len() as u32).then_some(StatName(index))
    }

    pub fn index(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn as_str(self) -> &'static str {
        let table = names().lock().unwrap_or_else(|e| e.into_inner());
        table.names[self.0 as usize]
    }

    /// Short name of a long name (the name itself for plain names).
    pub fn short_name(self) -> StatName {
        let s = self.as_str();
        let short = short_name_of(s);
        if short.len() == s.len() {
            self
        } else {
            StatName::new(short)
        }
    }

    pub fn group_name(self) -> Option<StatName> {
        group_name_of(self.as_str()).map(StatName::new)
    }

    pub fn description(self) -> Option<&'static str> {
        description_of(self.as_str())
    }

    pub fn category(self) -> Option<&'static str> {
        category_of(self.as_str())
    }
}

impl Default for StatName {
    fn default() -> Self {
        StatName::NONE
    }
}

impl PartialOrd for StatName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StatName {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            return Ordering::Equal;
        }
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for StatName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for StatName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatName({:?})", self.as_str())
    }
}

impl From<&str> for StatName {
    fn from(s: &str) -> Self {
        StatName::new(s)
    }
}

/// Names the engine itself creates or recognizes.
pub(crate) struct WellKnown {
    pub(crate) thread_root: StatName,
    pub(crate) self_: StatName,
    pub(crate) other_children: StatName,
    pub(crate) advance_frame: StatName,
    pub(crate) event_wait_with_id: StatName,
    pub(crate) event_trigger_with_id: StatName,
    pub(crate) unknown: StatName,
    pub(crate) threads_group: StatName,
    pub(crate) game_thread: StatName,
    pub(crate) render_thread: StatName,
    pub(crate) groups_group: StatName,
    pub(crate) seconds_per_cycle: StatName,
}

pub const THREAD_ROOT: &str = "ThreadRoot";
pub const SELF_NAME: &str = "Self";
pub const OTHER_CHILDREN: &str = "OtherChildren";
pub const NAME_FOLDER_PREFIX: &str = "NameFolder//";
pub const THREADS_GROUP: &str = "STATGROUP_Threads";
pub const GROUPS_GROUP: &str = "Groups";
pub const GAME_THREAD: &str = "GameThread";
pub const RENDER_THREAD: &str = "RenderThread";
pub const EVENT_WAIT_WITH_ID: &str = "EventWaitWithId";
pub const EVENT_TRIGGER_WITH_ID: &str = "EventTriggerWithId";
pub const SECONDS_PER_CYCLE: &str = "STAT_SecondsPerCycle";
pub const UNKNOWN: &str = "Unknown";

static WELL_KNOWN: OnceLock<WellKnown> = OnceLock::new();

pub(crate) fn well_known() -> &'static WellKnown {
    WELL_KNOWN.get_or_init(|| WellKnown {
        thread_root: StatName::new(THREAD_ROOT),
        self_: StatName::new(SELF_NAME),
        other_children: StatName::new(OTHER_CHILDREN),
        advance_frame: StatName::new("AdvanceFrame"),
        event_wait_with_id: StatName::new(EVENT_WAIT_WITH_ID),
        event_trigger_with_id: StatName::new(EVENT_TRIGGER_WITH_ID),
        unknown: StatName::new(UNKNOWN),
        threads_group: StatName::new(THREADS_GROUP),
        game_thread: StatName::new(GAME_THREAD),
        render_thread: StatName::new(RENDER_THREAD),
        groups_group: StatName::new(GROUPS_GROUP),
        seconds_per_cycle: StatName::new(SECONDS_PER_CYCLE),
    })
}

/// Build `//GROUP//SHORT///DESCRIPTION///####CATEGORY####`, omitting absent parts.
pub fn long_name(
    short: &str,
    group: Option<&str>,
    description: Option<&str>,
    category: Option<&str>,
) -> String {
    let mut out = String::with_capacity(short.len() + 32);
    if let Some(group) = group {
        out.push_str("//");
        out.push_str(group);
        out.push_str("//");
    }
    out.push_str(short);
    if let Some(desc) = description {
        out.push_str("///");
        out.push_str(&desc.replace("///", "/"));
        out.push_str("///");
    }
    if let Some(category) = category {
        out.push_str("####");
        out.push_str(category);
        out.push_str("####");
    }
    out
}

pub fn short_name_of(long: &str) -> &str {
    let mut rest = long;
    if let Some(after) = rest.strip_prefix("//")
        && let Some(end) = after.find("//")
    {
        rest = &after[end + 2..];
    }
    let cut = [rest.find("///"), rest.find("####")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(rest.len());
    &rest[..cut]
}

pub fn group_name_of(long: &str) -> Option<&str> {
    let after = long.strip_prefix("//")?;
    let end = after.find("//")?;
    Some(&after[..end])
}

pub fn description_of(long: &str) -> Option<&str> {
    let start = long.find("///")? + 3;
    let len = long[start..].find("///")?;
    Some(&long[start..start + len])
}

pub fn category_of(long: &str) -> Option<&str> {
    let start = long.find("####")? + 4;
    let len = long[start..].find("####")?;
    Some(&long[start..start + len])
}

/// Thread description carrying the thread id, as registered in `STATGROUP_Threads`.
pub fn thread_description(thread_id: u32) -> String {
    format!("Thread_{thread_id:x}_0")
}

pub fn parse_thread_id(description: &str) -> Option<u32> {
    let hex = description.strip_prefix("Thread_")?;
    let hex = hex.strip_suffix("_0").unwrap_or(hex);
    u32::from_str_radix(hex, 16).ok()
}
