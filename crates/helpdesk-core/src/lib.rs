pub mod outcome;
pub mod session;
pub mod thread;
pub mod tree;

use sha2::{Digest, Sha256};

pub use outcome::{resolution_tag_for, HitRecord, NodeCounts, OutcomeKind};
pub use session::{
    EndReason, NextStep, OptionLayout, Session, SessionKey, SessionState, OPTION_MENU_THRESHOLD,
};
pub use thread::{
    closing_notice, mention_for, normalize_template_input, render_triage_message,
    ArchiveRequest, ForumGateway, GatewayError, ThreadActivity, ThreadCreated, ThreadState,
    TriagePost, WatchedThread, DEFAULT_TRIAGE_TEMPLATE, MENTION_PLACEHOLDER,
};
pub use tree::{
    CollectField, DecisionTree, Edge, GraphDescription, NodeDefinition, NodeKind,
    OptionDefinition, TreeError, TreeNode, ValidationProblem, DEFAULT_ROOT_ID, MAX_NODE_ID_LEN,
};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
