//! The creator ID invariant: the annotation naming the user which created an object must be set
//! to the requesting user on create and can't be changed afterwards.
use std::collections::BTreeMap;

use kube::core::admission::Operation;

use crate::{admission::response::Denial, constants::CREATOR_ID_ANNOTATION};

pub const MISMATCHED_CREATOR_MESSAGE: &str = "creatorID annotation does not match user";
pub const CHANGED_CREATOR_MESSAGE: &str = "creatorID annotation cannot be changed";

/// Checks the creator ID annotation of an object.
///
/// On create the annotation must equal `username`. On every other operation the annotation may
/// be removed, but it must not take a value different from the one on the old object.
pub fn check(
    operation: &Operation,
    username: &str,
    old_annotations: Option<&BTreeMap<String, String>>,
    new_annotations: Option<&BTreeMap<String, String>>,
) -> Option<Denial> {
    let new_creator = new_annotations.and_then(|annotations| annotations.get(CREATOR_ID_ANNOTATION));

    if *operation == Operation::Create {
        return (new_creator.map(String::as_str) != Some(username))
            .then(|| Denial::invalid(MISMATCHED_CREATOR_MESSAGE));
    }

    let new_creator = new_creator?;
    let old_creator = old_annotations.and_then(|annotations| annotations.get(CREATOR_ID_ANNOTATION));

    (old_creator != Some(new_creator)).then(|| Denial::invalid(CHANGED_CREATOR_MESSAGE))
}
