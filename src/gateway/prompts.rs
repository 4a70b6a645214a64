use super::{GenerationContext, PromptKind};

/// Cap on embedded failure output. The tail carries the exception.
const MAX_FAILURE_CHARS: usize = 6000;

pub const REPRODUCTION_SCRIPT_SYSTEM: &str = r#"You are a senior Python engineer reproducing a reported runtime failure.

Write a standalone Python script that imports or runs the code in the repository and triggers the reported error.

RULES:
- The script must exit with a non-zero status and print the traceback to stderr when the bug is present
- Do not fix the bug, do not catch the exception
- Use only the standard library and the repository's own modules
- No network access is available

Return ONLY raw Python source. No explanations. No markdown."#;

pub const FIX_CONTENT_SYSTEM: &str = r#"You are a senior Python engineer. Fix ONLY the runtime error shown.

RULES:
- Make the smallest possible change required to stop the failure
- Do not refactor, rename, reorder or reformat unrelated code
- Keep every existing function and class unless removing it is required for the fix
- Return the FULL updated file, from the first line to the last

Return ONLY raw source for the full corrected file. No explanations. No markdown."#;

pub const PR_DESCRIPTION_SYSTEM: &str = r#"You are writing a pull request description for a verified bug fix.

Write in plain prose with short paragraphs:
- What failed and how it surfaced
- What was changed to fix it
- How the fix was verified

Do not include code fences. Keep it under 200 words."#;

pub fn system_prompt(kind: PromptKind) -> &'static str {
    match kind {
        PromptKind::ReproductionScript => REPRODUCTION_SCRIPT_SYSTEM,
        PromptKind::FixContent => FIX_CONTENT_SYSTEM,
        PromptKind::PrDescription => PR_DESCRIPTION_SYSTEM,
    }
}

pub fn user_prompt(kind: PromptKind, ctx: &GenerationContext) -> String {
    match kind {
        PromptKind::ReproductionScript => format!(
            "Reported error:\n{}\n\nEntry file ({}):\n{}\n\nWrite the reproduction script.",
            ctx.error_description, ctx.target_file, ctx.original_content
        ),
        PromptKind::FixContent => {
            let failure = ctx
                .failure_output
                .as_deref()
                .map(|text| crate::util::tail_chars(text, MAX_FAILURE_CHARS))
                .unwrap_or_default();
            let mut prompt = format!(
                "Reported error:\n{}\n\nFailure output:\n{}\n\nOriginal file ({}):\n{}\n",
                ctx.error_description, failure, ctx.target_file, ctx.original_content
            );
            if ctx.attempt > 1 {
                prompt.push_str(&format!(
                    "\nThis is attempt {}. The previous attempt was rejected or failed verification; \
                     the failure output above is from that attempt. The original file has {} lines.\n",
                    ctx.attempt,
                    ctx.original_content.lines().count()
                ));
            }
            prompt.push_str("\nFix the bug and return the full corrected file.");
            prompt
        }
        PromptKind::PrDescription => format!(
            "Reported error:\n{}\n\nFile: {}\n\nVerified diff:\n{}\n",
            ctx.error_description,
            ctx.target_file,
            ctx.diff.as_deref().unwrap_or("")
        ),
    }
}
