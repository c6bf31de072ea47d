// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative workchain outlines and their resumable interpreter.
//!
//! An outline is a tree of steps and control nodes (`if`/`while`/`return`)
//! that fixes the order in which a workchain's steps may run. The
//! interpreter advances through the tree one action at a time: each tick
//! executes exactly one leaf step or evaluates exactly one predicate, then
//! yields so the position can be checkpointed. The position is a stack of
//! frames into the tree, plain data that serializes into the checkpoint
//! and reconstructs the exact resume point on any worker.
//!
//! Steps and predicates are referenced by name; the bodies live in the
//! process registry. That keeps the outline itself serializable.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::exit_code::ExitCode;

/// One node of an outline tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutlineNode {
    /// Run the named step.
    Step {
        /// Registered step name.
        name: String,
    },
    /// Evaluate arm predicates in order; run the body of the first arm
    /// whose predicate holds, or the `otherwise` body if none does.
    If {
        /// Conditional arms (`if`/`elif`), evaluated in order.
        arms: Vec<Arm>,
        /// The `else` body; empty when absent.
        otherwise: Vec<OutlineNode>,
    },
    /// Re-evaluate the predicate before every iteration; run the body
    /// while it holds.
    While {
        /// Registered predicate name.
        predicate: String,
        /// Loop body.
        body: Vec<OutlineNode>,
    },
    /// Leave the outline early with the given exit code (`None` = success).
    Return {
        /// Exit code to finish with; `None` means [`ExitCode::OK`].
        exit: Option<ExitCode>,
    },
}

impl OutlineNode {
    /// A step node.
    pub fn step(name: impl Into<String>) -> Self {
        Self::Step { name: name.into() }
    }
}

/// One conditional arm of an [`OutlineNode::If`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    /// Registered predicate name.
    pub predicate: String,
    /// Body to run when the predicate holds.
    pub body: Vec<OutlineNode>,
}

/// Build a conditional arm.
pub fn arm(predicate: impl Into<String>, body: Vec<OutlineNode>) -> Arm {
    Arm {
        predicate: predicate.into(),
        body,
    }
}

/// An ordered outline of steps and control nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Outline {
    nodes: Vec<OutlineNode>,
}

impl Outline {
    /// An empty outline. Registration rejects outlines that stay empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn step(mut self, name: impl Into<String>) -> Self {
        self.nodes.push(OutlineNode::step(name));
        self
    }

    /// Append a conditional. `arms` must not be empty.
    pub fn if_(mut self, arms: Vec<Arm>, otherwise: Vec<OutlineNode>) -> Self {
        self.nodes.push(OutlineNode::If { arms, otherwise });
        self
    }

    /// Append a loop.
    pub fn while_(mut self, predicate: impl Into<String>, body: Vec<OutlineNode>) -> Self {
        self.nodes.push(OutlineNode::While {
            predicate: predicate.into(),
            body,
        });
        self
    }

    /// Append an early return.
    pub fn return_(mut self, exit: Option<ExitCode>) -> Self {
        self.nodes.push(OutlineNode::Return { exit });
        self
    }

    /// Append every node of `other`, in order. Lets a base outline be
    /// extended by a refinement without re-declaring the shared prefix.
    pub fn extend(mut self, other: Outline) -> Self {
        self.nodes.extend(other.nodes);
        self
    }

    /// Whether the outline has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every step name referenced anywhere in the tree.
    pub fn step_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_names(&self.nodes, &mut names, &mut Vec::new());
        names
    }

    /// Every predicate name referenced anywhere in the tree.
    pub fn predicate_names(&self) -> Vec<&str> {
        let mut predicates = Vec::new();
        collect_names(&self.nodes, &mut Vec::new(), &mut predicates);
        predicates
    }

    /// The interpreter's starting position.
    ///
    /// Already normalized: the first action is immediately available.
    pub fn begin(&self) -> Result<OutlinePosition> {
        let mut position = OutlinePosition {
            frames: vec![Frame::Seq { index: 0 }],
        };
        self.normalize(&mut position)?;
        Ok(position)
    }

    /// What the interpreter should do next at `position`.
    pub fn next_action(&self, position: &OutlinePosition) -> Result<OutlineAction<'_>> {
        let Some(last) = position.frames.last() else {
            return Ok(OutlineAction::Done);
        };

        match last {
            Frame::Seq { index } => {
                let nodes = self.resolve_list(&position.frames[..position.frames.len() - 1])?;
                match nodes.get(*index) {
                    Some(OutlineNode::Step { name }) => Ok(OutlineAction::RunStep { name }),
                    Some(OutlineNode::Return { exit }) => Ok(OutlineAction::Return {
                        exit: exit.clone().unwrap_or(ExitCode::OK),
                    }),
                    Some(_) | None => Err(position_error()),
                }
            }
            Frame::Arm { arm } => {
                let node = self.resolve_node(&position.frames[..position.frames.len() - 1])?;
                let OutlineNode::If { arms, .. } = node else {
                    return Err(position_error());
                };
                let arm = arms.get(*arm).ok_or_else(position_error)?;
                Ok(OutlineAction::EvalPredicate {
                    name: &arm.predicate,
                })
            }
            Frame::Loop { .. } => {
                let node = self.resolve_node(&position.frames[..position.frames.len() - 1])?;
                let OutlineNode::While { predicate, .. } = node else {
                    return Err(position_error());
                };
                Ok(OutlineAction::EvalPredicate { name: predicate })
            }
        }
    }

    /// Advance past the step at `position` after it completed.
    pub fn step_completed(&self, position: &mut OutlinePosition) -> Result<()> {
        match position.frames.last_mut() {
            Some(Frame::Seq { index }) => {
                *index += 1;
                self.normalize(position)
            }
            _ => Err(position_error()),
        }
    }

    /// Record a predicate outcome and advance accordingly.
    pub fn predicate_evaluated(&self, position: &mut OutlinePosition, value: bool) -> Result<()> {
        match position.frames.last().cloned() {
            Some(Frame::Arm { arm }) => {
                if value {
                    position.frames.push(Frame::Seq { index: 0 });
                    return self.normalize(position);
                }
                let node = self.resolve_node(&position.frames[..position.frames.len() - 1])?;
                let OutlineNode::If { arms, otherwise } = node else {
                    return Err(position_error());
                };
                if arm + 1 < arms.len() {
                    // Try the next arm's predicate.
                    if let Some(Frame::Arm { arm }) = position.frames.last_mut() {
                        *arm += 1;
                    }
                    Ok(())
                } else if !otherwise.is_empty() {
                    // Fall through to the else body.
                    if let Some(Frame::Arm { arm }) = position.frames.last_mut() {
                        *arm = arms.len();
                    }
                    position.frames.push(Frame::Seq { index: 0 });
                    self.normalize(position)
                } else {
                    // No arm taken; skip the whole conditional.
                    position.frames.pop();
                    match position.frames.last_mut() {
                        Some(Frame::Seq { index }) => *index += 1,
                        _ => return Err(position_error()),
                    }
                    self.normalize(position)
                }
            }
            Some(Frame::Loop { .. }) => {
                if value {
                    position.frames.push(Frame::Seq { index: 0 });
                    self.normalize(position)
                } else {
                    position.frames.pop();
                    match position.frames.last_mut() {
                        Some(Frame::Seq { index }) => *index += 1,
                        _ => return Err(position_error()),
                    }
                    self.normalize(position)
                }
            }
            _ => Err(position_error()),
        }
    }

    /// Push descents until the position rests on an actionable frame.
    fn normalize(&self, position: &mut OutlinePosition) -> Result<()> {
        loop {
            let Some(last) = position.frames.last().cloned() else {
                return Ok(()); // Done.
            };

            match last {
                Frame::Seq { index } => {
                    let nodes = self.resolve_list(&position.frames[..position.frames.len() - 1])?;
                    match nodes.get(index) {
                        Some(OutlineNode::Step { .. }) | Some(OutlineNode::Return { .. }) => {
                            return Ok(());
                        }
                        Some(OutlineNode::If { arms, otherwise }) => {
                            if arms.is_empty() {
                                // Degenerate conditional: only an else body.
                                if otherwise.is_empty() {
                                    if let Some(Frame::Seq { index }) =
                                        position.frames.last_mut()
                                    {
                                        *index += 1;
                                    }
                                    continue;
                                }
                                position.frames.push(Frame::Arm { arm: 0 });
                                position.frames.push(Frame::Seq { index: 0 });
                            } else {
                                position.frames.push(Frame::Arm { arm: 0 });
                            }
                            return self.normalize_if_descended(position);
                        }
                        Some(OutlineNode::While { .. }) => {
                            position.frames.push(Frame::Loop { iterations: 0 });
                            return Ok(());
                        }
                        None => {
                            // Sequence exhausted; unwind one level.
                            position.frames.pop();
                            match position.frames.last().cloned() {
                                None => return Ok(()), // Whole outline done.
                                Some(Frame::Arm { .. }) => {
                                    // Conditional body done: skip past the If.
                                    position.frames.pop();
                                    match position.frames.last_mut() {
                                        Some(Frame::Seq { index }) => *index += 1,
                                        _ => return Err(position_error()),
                                    }
                                }
                                Some(Frame::Loop { iterations }) => {
                                    // Iteration done: re-evaluate the predicate.
                                    if let Some(Frame::Loop { iterations: n }) =
                                        position.frames.last_mut()
                                    {
                                        *n = iterations + 1;
                                    }
                                    return Ok(());
                                }
                                Some(Frame::Seq { .. }) => return Err(position_error()),
                            }
                        }
                    }
                }
                // Pending predicate evaluation; actionable as-is.
                Frame::Arm { .. } | Frame::Loop { .. } => return Ok(()),
            }
        }
    }

    /// After descending into a just-pushed frame, continue normalizing only
    /// when the descent landed inside a body (not on a pending predicate).
    fn normalize_if_descended(&self, position: &mut OutlinePosition) -> Result<()> {
        match position.frames.last() {
            Some(Frame::Seq { .. }) => self.normalize(position),
            _ => Ok(()),
        }
    }

    /// The node list addressed by a frame prefix (everything above the
    /// final Seq frame).
    fn resolve_list(&self, frames: &[Frame]) -> Result<&[OutlineNode]> {
        let mut nodes: &[OutlineNode] = &self.nodes;
        let mut frames = frames.iter();
        while let Some(frame) = frames.next() {
            let Frame::Seq { index } = frame else {
                return Err(position_error());
            };
            let node = nodes.get(*index).ok_or_else(position_error)?;
            let Some(descent) = frames.next() else {
                return Err(position_error());
            };
            nodes = match (node, descent) {
                (OutlineNode::If { arms, otherwise }, Frame::Arm { arm }) => {
                    if *arm < arms.len() {
                        &arms[*arm].body
                    } else {
                        otherwise
                    }
                }
                (OutlineNode::While { body, .. }, Frame::Loop { .. }) => body,
                _ => return Err(position_error()),
            };
        }
        Ok(nodes)
    }

    /// The control node addressed by a frame prefix ending in a Seq frame.
    fn resolve_node(&self, frames: &[Frame]) -> Result<&OutlineNode> {
        let Some((Frame::Seq { index }, prefix)) = frames.split_last() else {
            return Err(position_error());
        };
        let nodes = self.resolve_list(prefix)?;
        nodes.get(*index).ok_or_else(position_error)
    }
}

fn collect_names<'a>(
    nodes: &'a [OutlineNode],
    steps: &mut Vec<&'a str>,
    predicates: &mut Vec<&'a str>,
) {
    for node in nodes {
        match node {
            OutlineNode::Step { name } => steps.push(name),
            OutlineNode::If { arms, otherwise } => {
                for arm in arms {
                    predicates.push(&arm.predicate);
                    collect_names(&arm.body, steps, predicates);
                }
                collect_names(otherwise, steps, predicates);
            }
            OutlineNode::While { predicate, body } => {
                predicates.push(predicate);
                collect_names(body, steps, predicates);
            }
            OutlineNode::Return { .. } => {}
        }
    }
}

fn position_error() -> EngineError {
    EngineError::invalid_operation(
        "outline position is inconsistent with the outline tree".to_string(),
    )
}

/// A resumable position in an outline: a stack of frames from the root to
/// the current action.
///
/// Frames alternate between sequence indices and control descents. A
/// trailing [`Frame::Arm`] or [`Frame::Loop`] means a predicate evaluation
/// is pending; a trailing [`Frame::Seq`] addresses a step or return node.
/// An empty stack means the outline has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlinePosition {
    frames: Vec<Frame>,
}

impl OutlinePosition {
    /// Whether the outline has run to completion.
    pub fn is_done(&self) -> bool {
        self.frames.is_empty()
    }
}

/// One frame of an [`OutlinePosition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Index into the node list at this nesting level.
    Seq {
        /// Position within the list.
        index: usize,
    },
    /// Inside an `if`: which arm is pending or was taken. `arm` equal to
    /// the number of conditional arms addresses the `else` body.
    Arm {
        /// Arm index.
        arm: usize,
    },
    /// Inside a `while` body, counting completed iterations.
    Loop {
        /// Iterations completed so far.
        iterations: u64,
    },
}

/// What the interpreter should do at a position.
#[derive(Debug, Clone, PartialEq)]
pub enum OutlineAction<'a> {
    /// Run the named step, then call
    /// [`Outline::step_completed`].
    RunStep {
        /// Registered step name.
        name: &'a str,
    },
    /// Evaluate the named predicate, then call
    /// [`Outline::predicate_evaluated`].
    EvalPredicate {
        /// Registered predicate name.
        name: &'a str,
    },
    /// Finish the workchain with this exit code.
    Return {
        /// The exit to finish with.
        exit: ExitCode,
    },
    /// The outline has finished; finish the workchain with success.
    Done,
}
