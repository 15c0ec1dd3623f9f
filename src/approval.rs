//! Approval gate and the structured question/answer contract.
//!
//! The engine never talks to a person directly. Whenever it needs input
//! (an approval, a way past a blocked task, what to do when quality keeps
//! failing) it builds a [`Question`] with explicit options and hands it to a
//! [`Responder`]. Headless runs, scripted embeddings and the interactive CLI
//! differ only in which responder is plugged in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Mutex;

use crate::core::{TaskGraph, TaskId};
use crate::orchestration::WorkQueue;
use crate::util::blocking;
use crate::{clog, Error, Result};

pub const OPTION_APPROVE: &str = "approve";
pub const OPTION_REJECT: &str = "reject";
pub const OPTION_MODIFY: &str = "modify";
pub const OPTION_SKIP: &str = "skip";
pub const OPTION_ANSWER: &str = "answer";
pub const OPTION_RETRY: &str = "retry";
pub const OPTION_ABORT: &str = "abort";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Approval,
    Blocked,
    QualityStalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub kind: QuestionKind,
    pub task: Option<TaskId>,
    pub question: String,
    #[serde(default)]
    pub detail: String,
    pub options: Vec<String>,
}

impl Question {
    pub fn approval(task: &TaskId, title: &str, description: &str) -> Self {
        Self {
            kind: QuestionKind::Approval,
            task: Some(task.clone()),
            question: format!("Task {} ({}) needs approval before it runs.", task, title),
            detail: description.to_string(),
            options: vec![
                OPTION_APPROVE.to_string(),
                OPTION_REJECT.to_string(),
                OPTION_MODIFY.to_string(),
            ],
        }
    }

    pub fn blocked(task: &TaskId, reason: &str) -> Self {
        Self {
            kind: QuestionKind::Blocked,
            task: Some(task.clone()),
            question: format!("Task {} cannot proceed.", task),
            detail: reason.to_string(),
            options: vec![
                OPTION_SKIP.to_string(),
                OPTION_ANSWER.to_string(),
                OPTION_ABORT.to_string(),
            ],
        }
    }

    pub fn quality_stalled(detail: &str) -> Self {
        Self {
            kind: QuestionKind::QualityStalled,
            task: None,
            question: "All tasks are done but the quality gates keep failing.".to_string(),
            detail: detail.to_string(),
            options: vec![OPTION_RETRY.to_string(), OPTION_ABORT.to_string()],
        }
    }

    pub fn offers(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Answer {
    /// One of the offered options, with optional text (a rejection reason,
    /// a modified description, an answer to a blocker).
    Choice {
        option: String,
        #[serde(default)]
        note: Option<String>,
    },
    FreeText { text: String },
}

impl Answer {
    pub fn choice(option: &str) -> Self {
        Answer::Choice {
            option: option.to_string(),
            note: None,
        }
    }

    pub fn with_note(option: &str, note: &str) -> Self {
        Answer::Choice {
            option: option.to_string(),
            note: Some(note.to_string()),
        }
    }

    /// Interpret free text: an exact option name selects it, anything else
    /// is kept as text.
    pub fn parse(question: &Question, input: &str) -> Self {
        let trimmed = input.trim();
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, Some(rest.trim())),
            None => (trimmed, None),
        };
        let head = head.to_lowercase();
        if question.offers(&head) {
            return Answer::Choice {
                option: head,
                note: rest.filter(|r| !r.is_empty()).map(String::from),
            };
        }
        Answer::FreeText {
            text: trimmed.to_string(),
        }
    }
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn ask(&self, question: &Question) -> Result<Answer>;
}

/// Headless policy. With trust, approvals pass and blockers are skipped;
/// without it, risky tasks are rejected and blockers abort the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoResponder {
    pub trust: bool,
}

impl AutoResponder {
    pub fn new(trust: bool) -> Self {
        Self { trust }
    }
}

#[async_trait]
impl Responder for AutoResponder {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let answer = match (question.kind, self.trust) {
            (QuestionKind::Approval, true) => Answer::choice(OPTION_APPROVE),
            (QuestionKind::Approval, false) => {
                Answer::with_note(OPTION_REJECT, "not approved in headless mode without --trust")
            }
            (QuestionKind::Blocked, true) => Answer::choice(OPTION_SKIP),
            (QuestionKind::Blocked, false) => Answer::choice(OPTION_ABORT),
            (QuestionKind::QualityStalled, _) => Answer::choice(OPTION_ABORT),
        };
        clog!("Auto-answered {:?} question: {:?}", question.kind, answer);
        Ok(answer)
    }
}

/// Replays queued answers in order and records every question asked.
#[derive(Debug, Default)]
pub struct ScriptedResponder {
    answers: Mutex<VecDeque<Answer>>,
    asked: Mutex<Vec<Question>>,
}

impl ScriptedResponder {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<Question> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(question.clone());
        }
        let next = self
            .answers
            .lock()
            .map_err(|_| Error::Validation("scripted responder poisoned".to_string()))?
            .pop_front();
        next.ok_or_else(|| {
            Error::Validation(format!("no scripted answer for: {}", question.question))
        })
    }
}

/// Prompts on stdout and reads one line from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinResponder;

#[async_trait]
impl Responder for StdinResponder {
    async fn ask(&self, question: &Question) -> Result<Answer> {
        let question = question.clone();
        blocking(move || {
            let mut stdout = std::io::stdout();
            writeln!(stdout, "\n{}", question.question)?;
            if !question.detail.is_empty() {
                writeln!(stdout, "  {}", question.detail)?;
            }
            write!(stdout, "[{}] > ", question.options.join("/"))?;
            stdout.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(Answer::parse(&question, &line))
        })
        .await
    }
}

/// The caller's verdict on a task awaiting sign-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject(String),
    /// Approve with a replacement description.
    Modify(String),
}

impl ApprovalDecision {
    /// Anything that is not a recognised approve/modify counts as a
    /// rejection, carrying the text as the reason.
    pub fn from_answer(answer: Answer) -> Self {
        match answer {
            Answer::Choice { option, .. } if option == OPTION_APPROVE => ApprovalDecision::Approve,
            Answer::Choice { option, note } if option == OPTION_MODIFY => match note {
                Some(text) if !text.trim().is_empty() => ApprovalDecision::Modify(text),
                _ => ApprovalDecision::Approve,
            },
            Answer::Choice { note, .. } => {
                ApprovalDecision::Reject(note.unwrap_or_else(|| "rejected".to_string()))
            }
            Answer::FreeText { text } => ApprovalDecision::Reject(text),
        }
    }
}

/// Synchronous barrier in front of tasks flagged `requires_approval`.
pub struct ApprovalGate;

impl ApprovalGate {
    /// Eligible-by-dependency tasks still waiting for sign-off, in queue
    /// order.
    pub fn pending(graph: &TaskGraph, queue: &WorkQueue) -> Vec<TaskId> {
        queue
            .awaiting_approval(graph)
            .iter()
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn question(graph: &TaskGraph, id: &TaskId) -> Result<Question> {
        let task = graph.task(id)?;
        let detail = if task.description.is_empty() {
            format!("{} ({})", task.title, task.kind)
        } else {
            task.description.clone()
        };
        Ok(Question::approval(id, &task.title, &detail))
    }

    /// Ask the responder about one task.
    pub async fn review(
        graph: &TaskGraph,
        id: &TaskId,
        responder: &dyn Responder,
    ) -> Result<ApprovalDecision> {
        let question = Self::question(graph, id)?;
        let answer = responder.ask(&question).await?;
        Ok(ApprovalDecision::from_answer(answer))
    }

    /// Apply a decision. Rejection blocks the task with the reason; the rest
    /// of the graph is untouched.
    pub fn apply(graph: &mut TaskGraph, id: &TaskId, decision: &ApprovalDecision) -> Result<()> {
        match decision {
            ApprovalDecision::Approve => {
                graph.task_mut(id)?.approved = true;
                clog!("Task {} approved", id);
            }
            ApprovalDecision::Modify(description) => {
                let task = graph.task_mut(id)?;
                task.description = description.clone();
                task.approved = true;
                clog!("Task {} approved with modifications", id);
            }
            ApprovalDecision::Reject(reason) => {
                WorkQueue::mark_blocked(graph, id, &format!("rejected: {}", reason))?;
            }
        }
        Ok(())
    }
}
