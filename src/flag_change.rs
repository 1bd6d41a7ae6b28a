//! Flag change observation.
//!
//! [`FlagChangeNotifier`] diffs an old flag snapshot against a new one and dispatches typed
//! change callbacks to registered observers. Owners are weakly held: a dropped owner makes its
//! observers inert, and they are purged at the next notification round. Registrants are still
//! expected to deregister explicitly; a dangling registration is a leak, not an error.
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::feature_flag::{FeatureFlag, FlagKey};
use crate::flag_store::FlagsSource;
use crate::{FlagValue, Identity};

/// Owner handle binding an observer's lifetime. Observers whose owner has been dropped are
/// skipped at notification time.
pub type ObserverOwner = Arc<dyn Any + Send + Sync>;

/// Handler for a single watched flag changing.
pub type FlagChangeHandler = Box<dyn Fn(&ChangedFlag) + Send + Sync>;
/// Handler for a set of watched flags changing; receives only the changed subset.
pub type FlagCollectionChangeHandler =
    Box<dyn Fn(&HashMap<FlagKey, ChangedFlag>) + Send + Sync>;
/// Handler invoked when a sync round changed none of the owner's watched flags.
pub type FlagsUnchangedHandler = Box<dyn Fn() + Send + Sync>;
/// Runs after one notification round has invoked every eligible observer.
pub type NotificationCompletion = Box<dyn FnOnce() + Send>;

/// One flag's observed transition, as delivered to change handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedFlag {
    /// The flag that changed.
    pub key: FlagKey,
    /// Value before the sync round; [`FlagValue::Null`] when the flag did not exist.
    pub old_value: FlagValue,
    /// Source tag of the pre-round store.
    pub old_source: FlagsSource,
    /// Value after the sync round; [`FlagValue::Null`] when the flag was deleted.
    pub new_value: FlagValue,
    /// Source tag of the post-round store.
    pub new_source: FlagsSource,
}

/// Which flags an observer watches.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchedKeys {
    /// Every flag, plus a synthetic identity-level entry when anything changed.
    All,
    Keys(Vec<FlagKey>),
}

enum ChangeHandler {
    Single(FlagChangeHandler),
    Collection(FlagCollectionChangeHandler),
}

struct ChangeObserver {
    keys: WatchedKeys,
    owner: Weak<dyn Any + Send + Sync>,
    handler: ChangeHandler,
}

struct UnchangedObserver {
    owner: Weak<dyn Any + Send + Sync>,
    handler: FlagsUnchangedHandler,
}

#[derive(Default)]
struct Registry {
    change_observers: Vec<Arc<ChangeObserver>>,
    unchanged_observers: Vec<Arc<UnchangedObserver>>,
}

/// Diffs flag snapshots and dispatches change callbacks to weakly-owned observers.
///
/// Diffing and dispatch run on a spawned thread so the synchronizer's delivery path is never
/// blocked by handlers. Within one round every eligible observer is invoked exactly once;
/// ordering across owners is unspecified.
#[derive(Default)]
pub struct FlagChangeNotifier {
    registry: Mutex<Registry>,
}

impl FlagChangeNotifier {
    /// Create a notifier with no registered observers.
    pub fn new() -> FlagChangeNotifier {
        FlagChangeNotifier::default()
    }

    /// Watch one flag; `handler` receives that flag's [`ChangedFlag`] when it changes.
    pub fn observe(&self, key: impl Into<FlagKey>, owner: &ObserverOwner, handler: FlagChangeHandler) {
        self.register_change_observer(ChangeObserver {
            keys: WatchedKeys::Keys(vec![key.into()]),
            owner: Arc::downgrade(owner),
            handler: ChangeHandler::Single(handler),
        });
    }

    /// Watch a set of flags; `handler` receives the changed subset when any of them change.
    pub fn observe_keys(
        &self,
        keys: Vec<FlagKey>,
        owner: &ObserverOwner,
        handler: FlagCollectionChangeHandler,
    ) {
        self.register_change_observer(ChangeObserver {
            keys: WatchedKeys::Keys(keys),
            owner: Arc::downgrade(owner),
            handler: ChangeHandler::Collection(handler),
        });
    }

    /// Watch all flags. The delivered map additionally carries a synthetic entry keyed by the
    /// identity's own key whenever any flag changed.
    pub fn observe_all(&self, owner: &ObserverOwner, handler: FlagCollectionChangeHandler) {
        self.register_change_observer(ChangeObserver {
            keys: WatchedKeys::All,
            owner: Arc::downgrade(owner),
            handler: ChangeHandler::Collection(handler),
        });
    }

    /// Be told when a sync round changed none of this owner's watched flags.
    pub fn observe_flags_unchanged(&self, owner: &ObserverOwner, handler: FlagsUnchangedHandler) {
        let mut registry = self.lock_registry();
        registry.unchanged_observers.push(Arc::new(UnchangedObserver {
            owner: Arc::downgrade(owner),
            handler,
        }));
    }

    /// Remove this owner's observers watching exactly `key`.
    pub fn remove_observer(&self, key: &str, owner: &ObserverOwner) {
        self.remove_observers(&[key.to_owned()], owner);
    }

    /// Remove this owner's observers watching exactly the set `keys`.
    pub fn remove_observers(&self, keys: &[FlagKey], owner: &ObserverOwner) {
        let mut sorted_keys = keys.to_vec();
        sorted_keys.sort();
        let mut registry = self.lock_registry();
        registry.change_observers.retain(|observer| {
            if !owner_matches(&observer.owner, owner) {
                return true;
            }
            match &observer.keys {
                WatchedKeys::All => true,
                WatchedKeys::Keys(watched) => {
                    let mut watched = watched.clone();
                    watched.sort();
                    watched != sorted_keys
                }
            }
        });
    }

    /// Remove every observer registered by `owner`, including unchanged and watch-all observers.
    pub fn remove_observers_for_owner(&self, owner: &ObserverOwner) {
        let mut registry = self.lock_registry();
        registry
            .change_observers
            .retain(|observer| !owner_matches(&observer.owner, owner));
        registry
            .unchanged_observers
            .retain(|observer| !owner_matches(&observer.owner, owner));
    }

    /// Diff `old_flags` against `new_flags` and dispatch to every eligible observer, off the
    /// caller's thread. `completion` runs after the round finishes.
    ///
    /// Both snapshots must be internally consistent; the store's `all_flags()` provides that.
    pub fn notify_observers(
        &self,
        identity: &Identity,
        old_flags: HashMap<FlagKey, FeatureFlag>,
        old_source: FlagsSource,
        new_flags: HashMap<FlagKey, FeatureFlag>,
        new_source: FlagsSource,
        completion: Option<NotificationCompletion>,
    ) {
        let (change_observers, unchanged_observers) = {
            let mut registry = self.lock_registry();
            // Dead owners are purged here rather than at removal time.
            registry
                .change_observers
                .retain(|observer| observer.owner.strong_count() > 0);
            registry
                .unchanged_observers
                .retain(|observer| observer.owner.strong_count() > 0);
            (
                registry.change_observers.clone(),
                registry.unchanged_observers.clone(),
            )
        };

        let identity_key = identity.key.clone();
        std::thread::spawn(move || {
            let changed_flags =
                diff_flags(&old_flags, old_source, &new_flags, new_source);
            log::debug!(
                target: "flagsync",
                "notifying observers: {} changed flags", changed_flags.len()
            );

            // Owners that received a change callback this round, by owner pointer.
            let mut notified_owners: HashSet<*const ()> = HashSet::new();

            for observer in &change_observers {
                let Some(owner) = observer.owner.upgrade() else {
                    continue;
                };
                let delivered = match (&observer.keys, &observer.handler) {
                    (WatchedKeys::Keys(watched), ChangeHandler::Single(handler)) => {
                        let mut any = false;
                        for key in watched {
                            if let Some(change) = changed_flags.get(key) {
                                handler(change);
                                any = true;
                            }
                        }
                        any
                    }
                    (WatchedKeys::Keys(watched), ChangeHandler::Collection(handler)) => {
                        let subset: HashMap<FlagKey, ChangedFlag> = watched
                            .iter()
                            .filter_map(|key| {
                                changed_flags.get(key).map(|change| (key.clone(), change.clone()))
                            })
                            .collect();
                        if subset.is_empty() {
                            false
                        } else {
                            handler(&subset);
                            true
                        }
                    }
                    (WatchedKeys::All, ChangeHandler::Collection(handler)) => {
                        if changed_flags.is_empty() {
                            false
                        } else {
                            let mut all = changed_flags.clone();
                            all.insert(
                                identity_key.clone(),
                                ChangedFlag {
                                    key: identity_key.clone(),
                                    old_value: FlagValue::Null,
                                    old_source,
                                    new_value: FlagValue::Null,
                                    new_source,
                                },
                            );
                            handler(&all);
                            true
                        }
                    }
                    // observe() never registers a single-flag handler for All.
                    (WatchedKeys::All, ChangeHandler::Single(_)) => false,
                };
                if delivered {
                    notified_owners.insert(Arc::as_ptr(&owner) as *const ());
                }
            }

            for observer in &unchanged_observers {
                let Some(owner) = observer.owner.upgrade() else {
                    continue;
                };
                if !notified_owners.contains(&(Arc::as_ptr(&owner) as *const ())) {
                    (observer.handler)();
                }
            }

            if let Some(completion) = completion {
                completion();
            }
        });
    }

    fn register_change_observer(&self, observer: ChangeObserver) {
        self.lock_registry().change_observers.push(Arc::new(observer));
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .expect("thread holding observer registry lock should not panic")
    }
}

fn owner_matches(weak: &Weak<dyn Any + Send + Sync>, owner: &ObserverOwner) -> bool {
    std::ptr::eq(weak.as_ptr() as *const (), Arc::as_ptr(owner) as *const ())
}

fn diff_flags(
    old_flags: &HashMap<FlagKey, FeatureFlag>,
    old_source: FlagsSource,
    new_flags: &HashMap<FlagKey, FeatureFlag>,
    new_source: FlagsSource,
) -> HashMap<FlagKey, ChangedFlag> {
    let keys: HashSet<&FlagKey> = old_flags.keys().chain(new_flags.keys()).collect();
    keys.into_iter()
        .filter(|key| old_flags.get(*key) != new_flags.get(*key))
        .map(|key| {
            let value_of = |flag: Option<&FeatureFlag>| {
                flag.map(|f| f.value.clone()).unwrap_or(FlagValue::Null)
            };
            (
                key.clone(),
                ChangedFlag {
                    key: key.clone(),
                    old_value: value_of(old_flags.get(key)),
                    old_source,
                    new_value: value_of(new_flags.get(key)),
                    new_source,
                },
            )
        })
        .collect()
}
