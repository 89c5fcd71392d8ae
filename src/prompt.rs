use anyhow::Result;
use std::io::{self, Write};

pub fn prompt_string(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
    Ok(s)
}

/// Да/нет с дефолтом «нет»: подтверждением считается только y/yes.
pub fn confirm(prompt: &str) -> Result<bool> {
    let answer = prompt_string(prompt)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}
