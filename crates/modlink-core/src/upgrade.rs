//! Forward migration of stored action/feedback/config snapshots.
//!
//! Upgrade scripts are indexed from `0`. An instance whose `upgrade_index` is
//! `Some(k)` has had scripts `0..=k` applied and still needs `k+1..`; `None`
//! falls back to the module's baseline index. The pipeline absorbs instances
//! level by level, so each script runs at most once per invocation and never
//! sees an instance that is already past it.
//!
//! Scripts operate on cloned snapshots. If any script fails the whole run
//! fails and the caller's instances are left untouched.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{ModlinkError, Result};
use crate::messages::{UpgradedFeedback, UpgradedItemsMessage};
use crate::types::{ActionInstance, FeedbackInstance, OptionValues, StyleProps};

// ---------------------------------------------------------------------------
// Script interface
// ---------------------------------------------------------------------------

/// What a single script gets to look at.
pub struct UpgradeScriptProps<'a> {
    /// The module config, present only while the config itself still needs
    /// this script.
    pub config: Option<&'a Value>,
    pub actions: Vec<&'a ActionInstance>,
    pub feedbacks: Vec<&'a FeedbackInstance>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionPatch {
    pub id: String,
    pub action_id: String,
    pub options: OptionValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackPatch {
    pub id: String,
    pub feedback_id: String,
    pub options: OptionValues,
    /// Style to merge into the control, e.g. when an advanced feedback was
    /// converted to a boolean one.
    pub style: Option<StyleProps>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpgradeScriptResult {
    pub updated_config: Option<Value>,
    pub updated_actions: Vec<ActionPatch>,
    pub updated_feedbacks: Vec<FeedbackPatch>,
}

pub type UpgradeScript =
    Arc<dyn Fn(UpgradeScriptProps<'_>) -> anyhow::Result<UpgradeScriptResult> + Send + Sync>;

/// Wrap a closure as an [`UpgradeScript`].
pub fn script<F>(f: F) -> UpgradeScript
where
    F: Fn(UpgradeScriptProps<'_>) -> anyhow::Result<UpgradeScriptResult> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Index of the newest script, `None` when there are none.
pub fn latest_index(scripts: &[UpgradeScript]) -> Option<usize> {
    scripts.len().checked_sub(1)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpgradeOutcome {
    pub updated_actions: BTreeMap<String, ActionInstance>,
    pub updated_feedbacks: BTreeMap<String, UpgradedFeedback>,
    /// `Some` only if a script replaced the config.
    pub updated_config: Option<Value>,
}

impl UpgradeOutcome {
    /// The acknowledgement sent to the host so it can persist the migration.
    pub fn to_message(&self) -> UpgradedItemsMessage {
        UpgradedItemsMessage {
            updated_actions: self.updated_actions.clone(),
            updated_feedbacks: self.updated_feedbacks.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updated_actions.is_empty()
            && self.updated_feedbacks.is_empty()
            && self.updated_config.is_none()
    }
}

/// Instances sharing the same pending upgrade index, by position in the
/// working vectors.
#[derive(Debug, Default)]
struct UpgradeGroup {
    actions: Vec<usize>,
    feedbacks: Vec<usize>,
}

pub fn run_upgrades(
    actions: &[ActionInstance],
    feedbacks: &[FeedbackInstance],
    default_index: Option<usize>,
    scripts: &[UpgradeScript],
    config: Option<&Value>,
) -> Result<UpgradeOutcome> {
    let Some(latest) = latest_index(scripts) else {
        return Ok(UpgradeOutcome::default());
    };

    let mut actions: Vec<ActionInstance> = actions.to_vec();
    let mut feedbacks: Vec<FeedbackInstance> = feedbacks.to_vec();
    let mut config: Option<Value> = config.cloned();

    let mut groups: BTreeMap<Option<usize>, UpgradeGroup> = BTreeMap::new();
    for (pos, action) in actions.iter().enumerate() {
        let index = action.upgrade_index.or(default_index);
        groups.entry(index).or_default().actions.push(pos);
    }
    for (pos, feedback) in feedbacks.iter().enumerate() {
        let index = feedback.upgrade_index.or(default_index);
        groups.entry(index).or_default().feedbacks.push(pos);
    }

    // `None` orders before every `Some`, so it stands for "nothing applied yet".
    let first_script = groups
        .keys()
        .copied()
        .chain(std::iter::once(default_index))
        .min()
        .flatten()
        .map_or(0, |i| i + 1);

    let mut working = UpgradeGroup::default();
    let mut patched_actions: BTreeSet<usize> = BTreeSet::new();
    let mut patched_feedbacks: BTreeSet<usize> = BTreeSet::new();
    let mut styles: BTreeMap<usize, StyleProps> = BTreeMap::new();
    let mut config_changed = false;

    for (index, script) in scripts.iter().enumerate().skip(first_script) {
        if let Some(group) = groups.remove(&index.checked_sub(1)) {
            working.actions.extend(group.actions);
            working.feedbacks.extend(group.feedbacks);
        }

        let config_pending = config.is_some() && default_index.map_or(true, |d| d < index);
        if working.actions.is_empty() && working.feedbacks.is_empty() && !config_pending {
            continue;
        }

        let result = {
            let props = UpgradeScriptProps {
                config: if config_pending { config.as_ref() } else { None },
                actions: working.actions.iter().map(|&p| &actions[p]).collect(),
                feedbacks: working.feedbacks.iter().map(|&p| &feedbacks[p]).collect(),
            };
            script(props).map_err(|e| ModlinkError::Upgrade {
                index,
                message: format!("{e:#}"),
            })?
        };

        if let Some(new_config) = result.updated_config {
            if config_pending {
                config = Some(new_config);
                config_changed = true;
            }
        }

        for patch in result.updated_actions {
            let Some(&pos) = working.actions.iter().find(|&&p| actions[p].id == patch.id) else {
                continue;
            };
            let action = &mut actions[pos];
            action.action_id = patch.action_id;
            action.options = patch.options;
            patched_actions.insert(pos);
        }

        for patch in result.updated_feedbacks {
            let Some(&pos) = working
                .feedbacks
                .iter()
                .find(|&&p| feedbacks[p].id == patch.id)
            else {
                continue;
            };
            let feedback = &mut feedbacks[pos];
            feedback.feedback_id = patch.feedback_id;
            feedback.options = patch.options;
            if let Some(style) = patch.style {
                styles.entry(pos).or_default().extend(style);
            }
            patched_feedbacks.insert(pos);
        }
    }

    let mut outcome = UpgradeOutcome::default();
    for (pos, mut action) in actions.into_iter().enumerate() {
        if patched_actions.contains(&pos) || action.upgrade_index.is_some() {
            action.upgrade_index = Some(action.upgrade_index.map_or(latest, |i| i.max(latest)));
            outcome.updated_actions.insert(action.id.clone(), action);
        }
    }
    for (pos, mut feedback) in feedbacks.into_iter().enumerate() {
        if patched_feedbacks.contains(&pos) || feedback.upgrade_index.is_some() {
            feedback.upgrade_index =
                Some(feedback.upgrade_index.map_or(latest, |i| i.max(latest)));
            outcome.updated_feedbacks.insert(
                feedback.id.clone(),
                UpgradedFeedback {
                    feedback,
                    style: styles.remove(&pos),
                },
            );
        }
    }
    if config_changed {
        outcome.updated_config = config;
    }

    Ok(outcome)
}
