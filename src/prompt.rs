//! Prompt assembly for the outer LM.

use crate::environment::ReplResult;
use std::collections::HashMap;

/// Sentinel that should never appear in real templates.
const ESCAPE_SENTINEL: &str = "\x00LBRACE\x00";
/// Sentinel for escaped closing brace.
const ESCAPE_SENTINEL_CLOSE: &str = "\x00RBRACE\x00";

/// Build a prompt string with variable substitution.
///
/// Replaces `{key}` placeholders in the template with values from `vars`.
/// Use `{{` to insert a literal `{` and `}}` to insert a literal `}`.
///
/// # Example
///
/// ```
/// use rlm_runtime::prompt::render;
/// use std::collections::HashMap;
///
/// let mut vars = HashMap::new();
/// vars.insert("name".to_string(), "Alice".to_string());
/// let result = render("Hello {name}: {{\"k\": 1}}", &vars);
/// assert_eq!(result, r#"Hello Alice: {"k": 1}"#);
/// ```
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    // Pass 1: protect escaped braces
    let mut rendered = template.replace("{{", ESCAPE_SENTINEL);
    rendered = rendered.replace("}}", ESCAPE_SENTINEL_CLOSE);

    // Pass 2: substitute placeholders
    for (key, value) in vars {
        let placeholder = format!("{{{}}}", key);
        rendered = rendered.replace(&placeholder, value);
    }

    // Pass 3: restore escaped braces
    rendered = rendered.replace(ESCAPE_SENTINEL, "{");
    rendered.replace(ESCAPE_SENTINEL_CLOSE, "}")
}

/// Wrap text in a labeled section for structured prompts.
pub fn section(label: &str, content: &str) -> String {
    format!("## {}\n{}", label, content)
}

/// The system prompt installed at the start of every session.
///
/// The context itself is *not* inlined -- the model must reach it through
/// code, which is the whole point of the substrate.
pub fn system_prompt(language: &str, context_chars: usize, depth: u32) -> String {
    format!(
        r#"You drive a sandboxed {language} REPL. The working context is bound to the
variable `context` ({context_chars} characters); you cannot see it directly -- write code
to inspect it.

Emit code inside ```{language} fenced blocks. Blocks run in order; variables
persist between your turns. Available in the sandbox:

- context: the data to work on
- llm_query(prompt) / llm_query(prompt, model): ask a sub-model, returns its
  reply as a string ("[error] <code>" on failure)
- llm_query_batched(prompts) / llm_query_batched(prompts, model): concurrent
  sub-queries, replies in input order
- FINAL_VAR(name): finish the session with the variable `name` as the answer
- print(value): show yourself intermediate results

Work incrementally: inspect, compute, verify with print, and only then call
FINAL_VAR. Do not guess at the context's contents.

Recursion depth: {depth}
"#,
        language = language,
        context_chars = context_chars,
        depth = depth,
    )
}

/// Render one block's execution result as feedback for the next turn.
pub fn execution_feedback(index: usize, result: &ReplResult) -> String {
    let mut parts = Vec::new();
    if !result.stdout.is_empty() {
        parts.push(section(&format!("Block {} stdout", index), result.stdout.trim_end()));
    }
    if !result.stderr.is_empty() {
        parts.push(section(&format!("Block {} stderr", index), result.stderr.trim_end()));
    }
    if parts.is_empty() {
        let status = if result.success {
            "(no output)"
        } else {
            "(failed with no output)"
        };
        parts.push(section(&format!("Block {}", index), status));
    }
    parts.join("\n\n")
}
