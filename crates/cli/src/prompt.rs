use inquire::{Confirm as ConfirmPrompt, InquireError};
use sitekeeper_host::Confirm;
use tracing::warn;

const YES_FLAG_HINT: &str = "To answer such questions automatically use the '--yes' flag.";

/// Terminal confirmation. Without a terminal every question is answered "no".
pub struct PromptConfirm {
    assume_yes: bool,
}

impl PromptConfirm {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl Confirm for PromptConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        if self.assume_yes {
            warn!(question = prompt, "auto confirming");
            return true;
        }

        match ConfirmPrompt::new(prompt)
            .with_help_message(YES_FLAG_HINT)
            .with_default(false)
            .prompt()
        {
            Ok(answer) => answer,
            Err(InquireError::NotTTY) => {
                warn!(question = prompt, "input is not a terminal, answering no");
                false
            }
            Err(err) => {
                warn!(question = prompt, error = %err, "prompt failed, answering no");
                false
            }
        }
    }
}
