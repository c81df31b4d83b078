//! Producer-boundary validation
//!
//! Malformed events are rejected before they reach the inbound queue.

use super::{KeyAction, MotionAction, PointerCoords, PointerProperties, MAX_POINTERS, MAX_POINTER_ID};
use crate::dispatcher::error::{DispatchError, Result};

/// Keys accept only DOWN and UP.
pub fn validate_key_event(action: KeyAction) -> Result<()> {
    match action {
        KeyAction::Down | KeyAction::Up => Ok(()),
        other => Err(DispatchError::InvalidKeyAction(other.to_raw())),
    }
}

/// Check action, pointer count and pointer ids of a motion event.
pub fn validate_motion_event(
    action: MotionAction,
    properties: &[PointerProperties],
    coords: Option<&[PointerCoords]>,
) -> Result<()> {
    let count = properties.len();
    match action {
        MotionAction::PointerDown(index) | MotionAction::PointerUp(index) if index >= count => {
            return Err(DispatchError::InvalidMotionAction(action.to_raw()));
        }
        _ => {}
    }

    if count < 1 || count > MAX_POINTERS {
        return Err(DispatchError::InvalidPointerCount(count));
    }
    if let Some(coords) = coords {
        if coords.len() != count {
            return Err(DispatchError::InvalidPointerCount(coords.len()));
        }
    }

    let mut seen = 0u32;
    for property in properties {
        let id = property.id;
        if !(0..=MAX_POINTER_ID).contains(&id) {
            return Err(DispatchError::InvalidPointerId(id));
        }
        if seen & (1 << id) != 0 {
            return Err(DispatchError::DuplicatePointerId(id));
        }
        seen |= 1 << id;
    }
    Ok(())
}
