//! prompt.rs — Delimited continuations: the prompt stack and the
//! capture/resume/abort/shift protocol (spec §3 "Continuation",
//! §4.7).
//!
//! The VM keeps one prompt stack. `push_prompt`/`pop_prompt`
//! correspond to `with_prompt` entering/leaving a dynamic extent.
//! `capture` slices the frames and stack values between the current
//! point and a named prompt into a freestanding `ContinuationObj`;
//! `resume` splices that slice back onto the live stack so execution
//! continues as if the `capture` call had just returned the resume
//! value. `shift` is `capture` immediately followed by invoking the
//! handler with the captured continuation — the one-shot,
//! non-reentrant convenience form the spec calls out in §4.7's
//! worked example.

use crate::frame::CallFrame;
use crate::object::{ContinuationObj, ContinuationState, HeapHandle, PromptTagId};
use crate::value::Value;

/// One entry in the VM's prompt stack: the tag installed by
/// `PUSH_PROMPT`, and where in the frame/stack history it was
/// installed so `capture` knows how much to slice off.
#[derive(Debug, Clone, Copy)]
pub struct PromptEntry {
    pub tag: PromptTagId,
    /// The `PromptTag` heap object itself, kept alongside the id so
    /// it can be traced as a root while this prompt is active.
    pub tag_handle: HeapHandle,
    pub frame_index: usize,
    pub stack_base: usize,
}

#[derive(Default)]
pub struct PromptStack {
    entries: Vec<PromptEntry>,
}

impl PromptStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: PromptTagId, tag_handle: HeapHandle, frame_index: usize, stack_base: usize) {
        self.entries.push(PromptEntry { tag, tag_handle, frame_index, stack_base });
    }

    /// The `PromptTag` objects of every currently active prompt, to be
    /// marked as roots (spec: "all prompt tags on the prompt stack").
    pub fn tag_handles(&self) -> impl Iterator<Item = HeapHandle> + '_ {
        self.entries.iter().map(|e| e.tag_handle)
    }

    pub fn pop(&mut self) -> Option<PromptEntry> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the nearest (innermost) prompt with `tag`, searching from
    /// the top of the dynamic extent downward, per §4.7's "innermost
    /// matching prompt wins" rule.
    pub fn find_innermost(&self, tag: PromptTagId) -> Option<PromptEntry> {
        self.entries.iter().rev().copied().find(|e| e.tag == tag)
    }

    /// Index of the innermost matching prompt, for slicing.
    pub fn position_innermost(&self, tag: PromptTagId) -> Option<usize> {
        self.entries.iter().rposition(|e| e.tag == tag)
    }

    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    pub fn entries_from(&self, idx: usize) -> &[PromptEntry] {
        &self.entries[idx..]
    }
}

/// Slices `frames[boundary..]` and `stack[prompt.stack_base..]` off
/// the live VM state into a fresh `ContinuationObj`, leaving the
/// caller's `frames`/`stack` truncated to the prompt boundary.
/// `return_slot` is where the eventual `resume` value should be
/// written once splice-back completes.
///
/// `boundary` is normally `prompt.frame_index` (the first frame
/// pushed after the prompt), but when capture/shift/abort run in the
/// very frame that pushed the prompt — no intervening call, so no
/// frame exists yet at `prompt.frame_index` — it's clamped down to
/// the prompt-pushing frame itself, so the slice always includes at
/// least one frame.
pub fn capture_slice(
    frames: &mut Vec<CallFrame>,
    stack: &mut Vec<Value>,
    prompt: PromptEntry,
    return_slot: usize,
) -> ContinuationObj {
    let boundary = prompt.frame_index.min(frames.len().saturating_sub(1));
    let saved_frames = frames.split_off(boundary);
    let saved_stack = stack.split_off(prompt.stack_base);

    let (saved_ip, saved_chunk) = saved_frames
        .first()
        .map(|f| (f.ip, f.chunk.clone()))
        .expect("capture_slice: prompt boundary must have at least one frame above it");

    ContinuationObj {
        frames: saved_frames,
        stack: saved_stack,
        stack_base_offset: prompt.stack_base,
        saved_ip,
        saved_chunk,
        prompt_tag: prompt.tag,
        prompt_tag_handle: prompt.tag_handle,
        state: ContinuationState::Valid,
        return_slot,
    }
}

/// Splices a previously captured continuation back onto `frames`/
/// `stack`, rebasing its saved stack slice onto the live stack's
/// current length, and writes `resume_value` into the frame that
/// originally called `capture`. Marks the continuation `Consumed`
/// (one-shot unless the host explicitly clones it before resuming,
/// which `vitte-vm` does not expose — spec §4.7 treats `resume` as
/// consuming).
pub fn splice_resume(
    frames: &mut Vec<CallFrame>,
    stack: &mut Vec<Value>,
    cont: &mut ContinuationObj,
    resume_value: Value,
) -> Result<(), crate::error::ControlEffectKind> {
    if cont.state != ContinuationState::Valid {
        return Err(crate::error::ControlEffectKind::NotValid);
    }

    let new_base = stack.len();
    let shift = new_base as isize - cont.stack_base_offset as isize;

    stack.extend_from_slice(&cont.stack);
    stack[new_base + (cont.return_slot - cont.stack_base_offset)] = resume_value;

    // Every captured frame but the outermost one calls back into
    // another captured frame, so its `return_slot` lives inside the
    // sliced region and must move with it. The outermost frame's
    // `return_slot` targets the (uncaptured, never-moved) frame that
    // was live below the prompt, so it alone is left untouched.
    for (i, f) in cont.frames.iter_mut().enumerate() {
        f.stack_base = (f.stack_base as isize + shift) as usize;
        if i > 0 {
            f.return_slot = (f.return_slot as isize + shift) as usize;
        }
    }
    frames.append(&mut cont.frames);

    cont.state = ContinuationState::Consumed;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn innermost_match_wins_over_outer_prompts_with_same_tag() {
        let mut ps = PromptStack::new();
        ps.push(PromptTagId(1), HeapHandle(0), 0, 0);
        ps.push(PromptTagId(1), HeapHandle(1), 2, 10);
        let found = ps.find_innermost(PromptTagId(1)).unwrap();
        assert_eq!(found.frame_index, 2);
        assert_eq!(found.stack_base, 10);
    }

    #[test]
    fn no_match_returns_none() {
        let mut ps = PromptStack::new();
        ps.push(PromptTagId(1), HeapHandle(0), 0, 0);
        assert!(ps.find_innermost(PromptTagId(99)).is_none());
    }

    #[test]
    fn tag_handles_enumerates_every_active_prompt() {
        let mut ps = PromptStack::new();
        ps.push(PromptTagId(1), HeapHandle(5), 0, 0);
        ps.push(PromptTagId(2), HeapHandle(6), 1, 3);
        let handles: Vec<HeapHandle> = ps.tag_handles().collect();
        assert_eq!(handles, vec![HeapHandle(5), HeapHandle(6)]);
    }
}
