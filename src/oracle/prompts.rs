use super::GenerationRequest;
use crate::budget::{ExtractionLevel, FileRole};

pub const EDIT_PROTOCOL_SYSTEM: &str = r#"You are a senior developer implementing a change in an existing codebase. You've been given the task and the relevant files - now implement it.

OUTPUT FORMAT (a single JSON object, nothing else):
{
  "files": [
    {"path": "src/new_module.ts", "action": "create", "content": "full file content"},
    {"path": "src/small.ts", "action": "modify", "content": "full replacement content"},
    {
      "path": "src/app.ts",
      "action": "edit",
      "edits": [
        {"search": "exact text to find", "replace": "replacement text"}
      ]
    }
  ],
  "explanation": "1-2 sentence summary of what you changed"
}

CHOOSING AN ACTION:
- "edit" is the default for any file that already exists
- "create" is only for files that do not exist yet
- "modify" (full overwrite) is only allowed for files shown to you as FULL
- Never use "create" or "modify" on a file shown as SIGNATURES, TRUNCATED or SUMMARY; you have not seen its real content
- Each path may appear at most once

RULES FOR EDITS:
- search must be EXACT text from the file as shown (copy-paste precision)
- Include enough context (3-5 lines) that search is unique in the file
- Edits for one file are applied in order; each search is matched against the file after the previous edits
- Preserve indentation exactly - spaces and tabs matter
- Do NOT include line numbers in search or replace
- If any search is not found, the whole file's edit set is rejected

SURGICAL EDITS (MOST IMPORTANT):
- Make the smallest change that completes the task
- Do NOT reformat, reflow, or change whitespace unless required
- Do not rename, reorder, or clean up unrelated code
- Only touch files marked EDIT TARGET unless the task clearly needs a new file"#;

fn level_tag(level: ExtractionLevel) -> &'static str {
    match level {
        ExtractionLevel::Full => "FULL",
        ExtractionLevel::Signatures => "SIGNATURES",
        ExtractionLevel::Truncated => "TRUNCATED",
        ExtractionLevel::Summary => "SUMMARY",
    }
}

pub fn render_user_prompt(request: &GenerationRequest) -> String {
    let mut out = String::new();
    out.push_str("TASK:\n");
    out.push_str(request.instruction.trim());
    out.push_str("\n\n");

    if let Some(constraints) = request.constraints.as_deref().filter(|c| !c.trim().is_empty()) {
        out.push_str("CONSTRAINTS AND PATTERNS:\n");
        out.push_str(constraints.trim());
        out.push_str("\n\n");
    }

    if let Some(follow_up) = &request.follow_up {
        out.push_str(&follow_up.render());
        out.push_str("\n\n");
    }

    out.push_str("FILES:\n");
    for file in &request.files {
        let role = match file.role {
            FileRole::EditTarget => "EDIT TARGET",
            FileRole::Reference => "reference",
        };
        if !file.exists {
            out.push_str(&format!(
                "\n--- {} [{}, does not exist yet; use \"create\"] ---\n",
                file.path.display(),
                role
            ));
            continue;
        }
        out.push_str(&format!(
            "\n--- {} [{}, {}] ---\n",
            file.path.display(),
            role,
            level_tag(file.level)
        ));
        out.push_str(&file.content);
        if !file.content.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("--- end {} ---\n", file.path.display()));
    }
    out
}
