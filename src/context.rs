//! Prompt construction for the generation call.
//!
//! [`ContextAssembler::assemble`] turns a bot profile, the boundary decision,
//! the retrieved evidence and recent conversation history into a system
//! instruction plus chat turns. Document candidates are numbered `[1]`,
//! `[2]`, ... and returned as [`SourceRef`]s so the persisted message can
//! resolve the answer's citation markers. Memory candidates are listed
//! separately and never numbered.
//!
//! The two deterministic modes have their own renderers
//! ([`render_source_list`], [`render_refusal`]) and need no model call.

use serde::{Deserialize, Serialize};

use botmind_core::models::{CandidateMatch, ResponseMode, Role, SourceSummary};

use crate::generation::ChatTurn;
use crate::messages::{SourceRef, StoredMessage};
use crate::retriever::Retrieval;

/// Per-bot settings that shape a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotProfile {
    pub name: String,
    /// Free-form persona description prepended to every instruction.
    #[serde(default)]
    pub persona: String,
    #[serde(default = "default_true")]
    pub strict: bool,
    #[serde(default)]
    pub web_search_allowed: bool,
    /// Rephrase deterministic answers in the persona's voice (one model call).
    #[serde(default)]
    pub persona_rewrite: bool,
}

fn default_true() -> bool {
    true
}

impl BotProfile {
    pub fn strict(name: &str) -> Self {
        Self {
            name: name.to_string(),
            persona: String::new(),
            strict: true,
            web_search_allowed: false,
            persona_rewrite: false,
        }
    }

    pub fn open(name: &str) -> Self {
        Self {
            strict: false,
            ..Self::strict(name)
        }
    }
}

/// Refusal used when the evidence does not support an answer.
pub const REFUSAL_MESSAGE: &str = "I'm sorry, but I couldn't find information about that in the \
documents I have access to, so I can't give you a reliable answer. If you add a document that \
covers it, I'll be glad to help.";

/// A ready-to-send generation request.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub system: String,
    pub contents: Vec<ChatTurn>,
    /// Numbered document sources the answer may cite.
    pub sources: Vec<SourceRef>,
}

pub struct ContextAssembler {
    separator: String,
}

impl ContextAssembler {
    pub fn new(separator: &str) -> Self {
        Self {
            separator: separator.to_string(),
        }
    }

    pub fn assemble(
        &self,
        bot: &BotProfile,
        question: &str,
        mode: ResponseMode,
        retrieval: Option<&Retrieval>,
        history: &[StoredMessage],
    ) -> AssembledPrompt {
        let documents: &[CandidateMatch] = retrieval.map(|r| r.documents.as_slice()).unwrap_or(&[]);
        let memories: &[CandidateMatch] = retrieval.map(|r| r.memories.as_slice()).unwrap_or(&[]);
        let sources = SourceRef::numbered(documents);

        let mut system = persona_header(bot);
        match mode {
            ResponseMode::StrictAnswerWithContext => {
                system.push_str(
                    "Answer ONLY from the numbered sources below. Do not use outside knowledge. \
                     Cite every claim with the source number in square brackets, like [1]. If the \
                     sources do not contain the answer, say so plainly instead of guessing.\n\n",
                );
            }
            ResponseMode::NonStrictWebOrGeneral => {
                system.push_str(
                    "Answer helpfully. Prefer the numbered sources below when they are relevant \
                     and cite them like [1]; otherwise you may use general knowledge.\n\n",
                );
            }
            ResponseMode::StrictRefusal | ResponseMode::ListSources => {
                system.push_str(&self.refusal_instruction(bot));
                system.push_str("\n\n");
            }
        }

        if !documents.is_empty() {
            system.push_str("Sources:\n");
            for (r, c) in sources.iter().zip(documents) {
                system.push_str(&format!(
                    "[{}] {} (part {} of {}):\n{}\n\n",
                    r.index,
                    c.source,
                    c.chunk_index + 1,
                    c.total_chunks.max(1),
                    c.content.trim()
                ));
            }
        }

        if !memories.is_empty() {
            system.push_str("Things you remember about this user (not citable):\n");
            for m in memories {
                system.push_str(&format!("- {}\n", m.content.trim()));
            }
            system.push('\n');
        }

        system.push_str(&self.suggestion_instruction());

        let mut contents: Vec<ChatTurn> = history
            .iter()
            .map(|m| ChatTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        contents.push(ChatTurn {
            role: Role::User,
            content: question.to_string(),
        });

        AssembledPrompt {
            system,
            contents,
            sources,
        }
    }

    /// Instruction for the single guardrail call that replaces an uncited
    /// strict answer.
    pub fn refusal_instruction(&self, bot: &BotProfile) -> String {
        format!(
            "{}You must not answer the user's question. Politely explain that the documents \
             you have access to do not contain this information. Do not add any facts, \
             sources, or citation markers. Keep it to two sentences.",
            persona_header(bot)
        )
    }

    /// Instruction for rephrasing a deterministic answer in the persona's voice.
    pub fn rewrite_instruction(&self, bot: &BotProfile) -> String {
        format!(
            "{}Rewrite the following message in your own voice. Keep every fact, file name \
             and list item exactly as given. Do not add information, sources, or citation \
             markers. Reply with the rewritten message only.",
            persona_header(bot)
        )
    }

    fn suggestion_instruction(&self) -> String {
        format!(
            "After your answer, write {} on its own line followed by a JSON array of up to 3 \
             short follow-up questions the user might ask next. Never mention this separator \
             or the array in your answer.",
            self.separator
        )
    }
}

fn persona_header(bot: &BotProfile) -> String {
    if bot.persona.trim().is_empty() {
        format!("You are {}.\n\n", bot.name)
    } else {
        format!("You are {}. {}\n\n", bot.name, bot.persona.trim())
    }
}

/// LIST_SOURCES answer rendered from index metadata.
pub fn render_source_list(sources: &[SourceSummary]) -> String {
    if sources.is_empty() {
        return "I don't have any documents yet. Upload a file or add a link and I'll answer \
                from it."
            .to_string();
    }
    let mut out = format!(
        "I can answer from {} document{}:\n",
        sources.len(),
        if sources.len() == 1 { "" } else { "s" }
    );
    for s in sources {
        out.push_str(&format!("- {}\n", s.source_name));
    }
    out.truncate(out.trim_end().len());
    out
}

/// STRICT_REFUSAL answer.
pub fn render_refusal() -> String {
    REFUSAL_MESSAGE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use botmind_core::citations::has_citation_marker;
    use botmind_core::models::RecordKind;

    fn cand(source: &str, content: &str, kind: RecordKind) -> CandidateMatch {
        CandidateMatch {
            content: content.into(),
            source: source.into(),
            source_id: source.into(),
            chunk_index: 0,
            total_chunks: 2,
            score: 0.2,
            kind,
        }
    }

    fn retrieval() -> Retrieval {
        Retrieval {
            query_type: None,
            documents: vec![
                cand("a.pdf", "Alpha facts.", RecordKind::Document),
                cand("b.pdf", "Beta facts.", RecordKind::Document),
            ],
            memories: vec![cand("memory", "Likes tea.", RecordKind::Memory)],
        }
    }

    #[test]
    fn test_strict_prompt_numbers_documents_only() {
        let a = ContextAssembler::new("|||SUGGESTIONS|||");
        let r = retrieval();
        let p = a.assemble(
            &BotProfile::strict("Ada"),
            "What?",
            ResponseMode::StrictAnswerWithContext,
            Some(&r),
            &[],
        );
        assert_eq!(p.sources.len(), 2);
        assert!(p.system.contains("[1] a.pdf (part 1 of 2):\nAlpha facts."));
        assert!(p.system.contains("[2] b.pdf"));
        assert!(!p.system.contains("[3]"));
        assert!(p.system.contains("- Likes tea."));
        assert!(p.system.contains("ONLY from the numbered sources"));
        assert!(p.system.contains("|||SUGGESTIONS|||"));
    }

    #[test]
    fn test_history_precedes_question() {
        let a = ContextAssembler::new("|||SUGGESTIONS|||");
        let history = vec![StoredMessage {
            id: "m1".into(),
            turn_key: "t0:user".into(),
            conversation_id: "c".into(),
            role: Role::User,
            content: "Earlier".into(),
            suggestions: vec![],
            sources: vec![],
            mode: None,
            created_at: 0,
        }];
        let p = a.assemble(
            &BotProfile::open("Ada"),
            "Now?",
            ResponseMode::NonStrictWebOrGeneral,
            None,
            &history,
        );
        assert_eq!(p.contents.len(), 2);
        assert_eq!(p.contents[0].content, "Earlier");
        assert_eq!(p.contents[1].content, "Now?");
        assert!(p.sources.is_empty());
    }

    #[test]
    fn test_deterministic_renderers() {
        assert!(!has_citation_marker(&render_refusal(), 10));
        let listed = render_source_list(&[SourceSummary {
            source_id: "s1".into(),
            source_name: "guide.pdf".into(),
            chunk_count: 3,
            indexed_at: 0,
        }]);
        assert_eq!(listed, "I can answer from 1 document:\n- guide.pdf");
        assert!(render_source_list(&[]).contains("don't have any documents"));
    }

    #[test]
    fn test_persona_in_instructions() {
        let a = ContextAssembler::new("|||SUGGESTIONS|||");
        let mut bot = BotProfile::strict("Captain");
        bot.persona = "You speak like a sailor.".into();
        assert!(a.rewrite_instruction(&bot).starts_with("You are Captain. You speak like a sailor."));
        assert!(a.refusal_instruction(&bot).contains("must not answer"));
    }
}
