use flowrun_core::graph::NodeDef;
use flowrun_core::state::{key_is_truthy, State};

/// Where traversal goes after a node has run and its result was merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Loop condition unmet: run the same node again.
    Repeat,
    /// Continue at the named node (branch target or `next`).
    Goto(String),
    /// No branch matched and there is no `next`.
    End,
}

/// Pick the next step for `node` given the post-merge `state`.
///
/// The loop condition is checked first, then branches in definition order
/// (first truthy key wins), then `next` as the default arm.
pub fn transition(node: &NodeDef, state: &State) -> Transition {
    if let Some(condition) = &node.loop_condition {
        if !key_is_truthy(state, condition) {
            return Transition::Repeat;
        }
    }

    if let Some((_, target)) = node
        .branches
        .iter()
        .find(|(key, _)| key_is_truthy(state, key))
    {
        return Transition::Goto(target.to_string());
    }

    match &node.next {
        Some(next) => Transition::Goto(next.clone()),
        None => Transition::End,
    }
}
