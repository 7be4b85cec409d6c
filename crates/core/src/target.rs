//! Target descriptors: `[mode:]path`.

use crate::error::RedirectError;

const MAX_MODE_DIGITS: usize = 3;

/// A resolved rule value: optional octal permission mode plus socket path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub mode: Option<u32>,
    pub path: String,
}

impl TargetDescriptor {
    /// Parse a rule value. Validation happens here, at lookup time, rather
    /// than when the rule string is read.
    ///
    /// An empty mode segment (`:path`) parses as mode `000`.
    pub fn parse(target: &str) -> Result<Self, RedirectError> {
        if target.is_empty() || target.ends_with(':') {
            return Err(RedirectError::EmptyPath(target.to_string()));
        }

        let segments: Vec<&str> = target.split(':').collect();
        let (mode, path) = match segments.as_slice() {
            [path] => (None, *path),
            [mode, rest @ ..] => {
                let mode = parse_mode(mode)
                    .ok_or_else(|| RedirectError::InvalidMode(target.to_string()))?;
                if rest.len() > 1 {
                    return Err(RedirectError::ExtraSegment {
                        target: target.to_string(),
                        index: 1,
                    });
                }
                (Some(mode), rest[0])
            }
            [] => return Err(RedirectError::EmptyPath(target.to_string())),
        };

        Ok(TargetDescriptor {
            mode,
            path: path.to_string(),
        })
    }
}

fn parse_mode(digits: &str) -> Option<u32> {
    if digits.len() > MAX_MODE_DIGITS {
        return None;
    }
    digits.chars().try_fold(0u32, |mode, ch| {
        let digit = ch.to_digit(8)?;
        Some(mode * 8 + digit)
    })
}
