use regex::Regex;

/// A simple glob-like pattern supporting only `*`, used for matching
/// package names. Path matching goes through the real glob engine in
/// `turborepo-globwalk`; names don't need segment semantics.
pub enum SimpleGlob {
    Regex(Regex),
    String(String),
    Any,
}

pub trait Match {
    fn is_match(&self, s: &str) -> bool;
}

impl SimpleGlob {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        if pattern == "*" {
            Ok(SimpleGlob::Any)
        } else if pattern.contains('*') {
            let regex = Regex::new(&format!(
                "^{}$",
                pattern
                    .split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*")
            ))?;
            Ok(SimpleGlob::Regex(regex))
        } else {
            Ok(SimpleGlob::String(pattern.to_string()))
        }
    }
}

impl Match for SimpleGlob {
    fn is_match(&self, s: &str) -> bool {
        match self {
            SimpleGlob::Regex(regex) => regex.is_match(s),
            SimpleGlob::String(string) => string == s,
            SimpleGlob::Any => true,
        }
    }
}
