//! Visitor assignment and action deduplication.
//!
//! A visitor's experiment state lives entirely in their cookies: the server holds no session
//! table. A visitor starts out unassigned, is placed into a [`Group`] on their first page request,
//! and from then on is recognized by the assignment cookie. Independently, a second cookie records
//! whether the visitor's action has already been counted.
use std::{
    fmt,
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use hyper::HeaderMap;
use rand::Rng;

use crate::cookies::{RequestCookies, ASSIGNMENT_COOKIE, COUNTED_COOKIE, COUNTED_VALUE};

/// An experiment arm.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Group {
    /// The baseline experience.
    Control,

    /// The experience under test.
    Variant,
}

impl Group {
    /// Gets the cookie value identifying this group.
    pub fn as_str(&self) -> &'static str {
        match self {
            Group::Control => "control",
            Group::Variant => "variant",
        }
    }

    /// Gets the backend path serving this group's page.
    pub fn page_path(&self) -> &'static str {
        match self {
            Group::Control => "/abtest/control",
            Group::Variant => "/abtest/variant",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Group {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(Group::Control),
            "variant" => Ok(Group::Variant),
            _ => Err(()),
        }
    }
}

/// One of the four experiment counters.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Tally {
    /// Control pages shown to newly-assigned visitors.
    ControlShow,

    /// Actions taken by control visitors.
    ControlAction,

    /// Variant pages shown to newly-assigned visitors.
    VariantShow,

    /// Actions taken by variant visitors.
    VariantAction,
}

impl Tally {
    /// All tallies, in result order.
    pub const ALL: [Tally; 4] =
        [Tally::ControlShow, Tally::ControlAction, Tally::VariantShow, Tally::VariantAction];

    /// Gets the show tally for `group`.
    pub fn show(group: Group) -> Self {
        match group {
            Group::Control => Tally::ControlShow,
            Group::Variant => Tally::VariantShow,
        }
    }

    /// Gets the action tally for `group`.
    pub fn action(group: Group) -> Self {
        match group {
            Group::Control => Tally::ControlAction,
            Group::Variant => Tally::VariantAction,
        }
    }

    /// Gets the counter name backing this tally.
    pub fn counter_name(&self) -> &'static str {
        match self {
            Tally::ControlShow => "controlShow",
            Tally::ControlAction => "controlAction",
            Tally::VariantShow => "variantShow",
            Tally::VariantAction => "variantAction",
        }
    }
}

/// A source of group assignments for new visitors.
pub trait GroupSource: Send + Sync {
    /// Chooses a group for a newly-arrived visitor.
    fn choose(&self) -> Group;
}

/// Chooses between the groups with equal probability using the thread-local generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngSource;

impl GroupSource for ThreadRngSource {
    fn choose(&self) -> Group {
        choose_with(&mut rand::rng())
    }
}

/// Chooses between the groups with equal probability using the given generator.
///
/// Useful when a reproducible sequence of assignments is needed.
#[derive(Debug)]
pub struct RngSource<R> {
    rng: Mutex<R>,
}

impl<R> RngSource<R> {
    /// Creates a new `RngSource` driven by `rng`.
    pub fn new(rng: R) -> Self {
        Self { rng: Mutex::new(rng) }
    }
}

impl<R> GroupSource for RngSource<R>
where
    R: Rng + Send,
{
    fn choose(&self) -> Group {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        choose_with(&mut *rng)
    }
}

/// Always chooses the same group.
#[derive(Clone, Copy, Debug)]
pub struct FixedSource(pub Group);

impl GroupSource for FixedSource {
    fn choose(&self) -> Group {
        self.0
    }
}

fn choose_with<R: Rng>(rng: &mut R) -> Group {
    if rng.random_bool(0.5) {
        Group::Control
    } else {
        Group::Variant
    }
}

/// A visitor's experiment state, as carried by their cookies.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Visitor {
    group: Option<Group>,
    action_counted: bool,
}

impl Visitor {
    /// Creates a `Visitor` with the given state.
    pub fn new(group: Option<Group>, action_counted: bool) -> Self {
        Self { group, action_counted }
    }

    /// Reads a visitor's state from the cookies in `headers`.
    ///
    /// An assignment cookie with an unrecognized value is treated as no assignment at all.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_cookies(&RequestCookies::from_headers(headers))
    }

    /// Reads a visitor's state from parsed request cookies.
    pub fn from_cookies(cookies: &RequestCookies<'_>) -> Self {
        let group = cookies.get(ASSIGNMENT_COOKIE).and_then(|value| value.parse().ok());
        let action_counted = cookies.get(COUNTED_COOKIE) == Some(COUNTED_VALUE);
        Self { group, action_counted }
    }

    /// Gets the visitor's group, if they have been assigned one.
    pub fn group(&self) -> Option<Group> {
        self.group
    }

    /// Whether the visitor's action has already been counted.
    pub fn action_counted(&self) -> bool {
        self.action_counted
    }

    /// Decides what a page request from this visitor means.
    ///
    /// Unassigned visitors are assigned a group from `source`; assigned visitors keep theirs.
    pub fn on_page(&self, source: &dyn GroupSource) -> PageOutcome {
        match self.group {
            Some(group) => PageOutcome::Returning(group),
            None => PageOutcome::Assigned(source.choose()),
        }
    }

    /// Decides what an action request from this visitor means.
    pub fn on_action(&self) -> ActionOutcome {
        match (self.group, self.action_counted) {
            (None, _) => ActionOutcome::Unassigned,
            (Some(group), true) => ActionOutcome::AlreadyCounted(group),
            (Some(group), false) => ActionOutcome::Count(group),
        }
    }
}

/// The result of a page request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageOutcome {
    /// The visitor was just assigned to this group: its show tally is counted and the assignment
    /// cookie is set.
    Assigned(Group),

    /// The visitor already belonged to this group: nothing is counted.
    Returning(Group),
}

impl PageOutcome {
    /// Gets the group whose page should be served.
    pub fn group(&self) -> Group {
        match self {
            PageOutcome::Assigned(group) | PageOutcome::Returning(group) => *group,
        }
    }

    /// Gets the tally to count for this outcome, if any.
    pub fn tally(&self) -> Option<Tally> {
        match self {
            PageOutcome::Assigned(group) => Some(Tally::show(*group)),
            PageOutcome::Returning(_) => None,
        }
    }
}

/// The result of an action request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActionOutcome {
    /// The action is counted against this group and the dedup cookie is set.
    Count(Group),

    /// The visitor's action was already counted: nothing is counted.
    AlreadyCounted(Group),

    /// The visitor has no group: nothing is counted.
    Unassigned,
}

impl ActionOutcome {
    /// Gets the tally to count for this outcome, if any.
    pub fn tally(&self) -> Option<Tally> {
        match self {
            ActionOutcome::Count(group) => Some(Tally::action(*group)),
            ActionOutcome::AlreadyCounted(_) | ActionOutcome::Unassigned => None,
        }
    }
}
