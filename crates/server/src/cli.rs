//! One-shot CLI transport: a fixed prompt, one reply, printed as a dialogue.

use std::io::Write;

use huanchat_core::ChatService;

/// The emperor's line sent by `huanchat generate`.
pub const DEFAULT_PROMPT: &str = "嬛嬛你怎么了，朕替你打抱不平！";

/// Generate a reply to [`DEFAULT_PROMPT`] and write both lines to `out`.
pub fn run_exchange<W: Write>(chat: &ChatService, out: &mut W) -> anyhow::Result<()> {
    let response = chat.reply(DEFAULT_PROMPT)?;
    writeln!(out, "皇上： {DEFAULT_PROMPT}")?;
    writeln!(out, "嬛嬛： {response}")?;
    out.flush()?;
    Ok(())
}
