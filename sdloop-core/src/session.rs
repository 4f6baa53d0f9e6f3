//! The interactive generation loop.
//!
//! A session alternates between two states. In [`SessionState::Generating`] the current request
//! record is snapshotted, handed to the generator and the result written to the output path. In
//! interactive mode the loop then prints [`GENERATION_DONE`] and moves to
//! [`SessionState::AwaitingInput`], where it reads one line per field of the mode (each preceded
//! by the field's label) before bumping the seed and generating again.
//!
//! Wire format, one value per line, no escaping:
//!
//! ```text
//! GENERATION_DONE
//! next prompt:      <- prompt
//! next output:      <- output path
//! init image:       <- initial image (image-to-image, inpaint)
//! mask image:       <- mask (inpaint)
//! ```
//!
//! End of input before the first field of a request ends the session cleanly. End of input in
//! the middle of a request is an error.

use std::{
    fmt,
    io::{BufRead, Write},
    path::PathBuf,
};

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info};

use crate::{save_image, Field, Mode, ModelLike, RequestRecord};

/// Printed after every successful generation in interactive mode.
pub const GENERATION_DONE: &str = "GENERATION_DONE";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("input ended before the {field} field of the next request was read")]
    TruncatedRequest { field: Field },
    #[error("{field} file {} does not exist", path.display())]
    MissingInput { field: Field, path: PathBuf },
    #[error("field {field} is not part of a {mode} request")]
    UnsupportedField { field: Field, mode: Mode },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Generating,
    AwaitingInput,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Generating => f.write_str("generating"),
            SessionState::AwaitingInput => f.write_str("awaiting input"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    /// Images written during the session.
    pub iterations: usize,
    /// Seed of the last generation.
    pub last_seed: u64,
}

/// Runs generations until the session ends.
///
/// Non-interactive sessions generate exactly once. Interactive sessions keep going until the
/// input is exhausted at a request boundary. Every failure is returned as is, there is no retry.
pub fn run_session<M, R, W>(
    model: &M,
    record: &mut RequestRecord,
    interactive: bool,
    mut input: R,
    mut output: W,
) -> anyhow::Result<SessionSummary>
where
    M: ModelLike + ?Sized,
    R: BufRead,
    W: Write,
{
    let mut iterations = 0;
    loop {
        debug!(state = %SessionState::Generating, seed = record.seed, "session state");
        let request = record.snapshot()?;
        let destination = record.output.clone();
        let last_seed = request.seed;

        info!(seed = last_seed, output = %destination.display(), "generating");
        let image = model.run(request)?;
        save_image(&image, &destination)
            .with_context(|| format!("failed to write {}", destination.display()))?;
        iterations += 1;

        if !interactive {
            return Ok(SessionSummary {
                iterations,
                last_seed,
            });
        }

        writeln!(output, "{GENERATION_DONE}")?;
        output.flush()?;

        debug!(state = %SessionState::AwaitingInput, "session state");
        if !read_request(record, &mut input, &mut output)? {
            info!(iterations, "input closed, ending session");
            return Ok(SessionSummary {
                iterations,
                last_seed,
            });
        }
        record.advance_seed();
    }
}

/// Reads the next request's fields into `record`. Returns `false` when the input ended cleanly
/// before the first field.
fn read_request<R: BufRead, W: Write>(
    record: &mut RequestRecord,
    input: &mut R,
    output: &mut W,
) -> Result<bool, SessionError> {
    for (index, &field) in record.mode().fields().iter().enumerate() {
        writeln!(output, "{}", field.label())?;
        output.flush()?;

        match read_line(input)? {
            Some(value) => {
                debug!(%field, %value, "read field");
                record.set(field, value)?;
            }
            None if index == 0 => return Ok(false),
            None => return Err(SessionError::TruncatedRequest { field }),
        }
    }
    Ok(true)
}

/// One line without its terminator, or `None` at end of input.
fn read_line<R: BufRead>(input: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}
