use std::{
    fmt,
    path::{Path, PathBuf},
};

use rand::Rng;

use crate::SessionError;

/// Upper bound (inclusive) of a seed drawn when none is supplied.
pub const SEED_RANGE_MAX: u64 = 1 << 30;

pub const DEFAULT_STEPS: usize = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// Draws a session seed uniformly from `0..=SEED_RANGE_MAX`.
pub fn draw_seed() -> u64 {
    rand::thread_rng().gen_range(0..=SEED_RANGE_MAX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    TextToImage,
    ImageToImage,
    Inpaint,
}

impl Mode {
    /// The fields read from standard input between two generations, in wire order.
    pub fn fields(self) -> &'static [Field] {
        match self {
            Mode::TextToImage => &[Field::Prompt, Field::Output],
            Mode::ImageToImage => &[Field::Prompt, Field::Output, Field::InitImage],
            Mode::Inpaint => &[Field::Prompt, Field::Output, Field::InitImage, Field::Mask],
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::TextToImage => "text-to-image",
            Mode::ImageToImage => "image-to-image",
            Mode::Inpaint => "inpaint",
        };
        f.write_str(name)
    }
}

/// A named field of the request record that can be replaced interactively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Prompt,
    Output,
    InitImage,
    Mask,
}

impl Field {
    /// Text written to stdout right before the field is read.
    pub fn label(self) -> &'static str {
        match self {
            Field::Prompt => "next prompt:",
            Field::Output => "next output:",
            Field::InitImage => "init image:",
            Field::Mask => "mask image:",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Prompt => "prompt",
            Field::Output => "output",
            Field::InitImage => "init_image",
            Field::Mask => "mask",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mode-specific inputs of a generation.
#[derive(Clone, Debug, PartialEq)]
pub enum Conditioning {
    TextToImage,
    ImageToImage { init_image: PathBuf, strength: f64 },
    Inpaint { init_image: PathBuf, mask: PathBuf },
}

impl Conditioning {
    pub fn mode(&self) -> Mode {
        match self {
            Conditioning::TextToImage => Mode::TextToImage,
            Conditioning::ImageToImage { .. } => Mode::ImageToImage,
            Conditioning::Inpaint { .. } => Mode::Inpaint,
        }
    }

    pub fn init_image(&self) -> Option<&Path> {
        match self {
            Conditioning::TextToImage => None,
            Conditioning::ImageToImage { init_image, .. }
            | Conditioning::Inpaint { init_image, .. } => Some(init_image),
        }
    }

    pub fn mask(&self) -> Option<&Path> {
        match self {
            Conditioning::Inpaint { mask, .. } => Some(mask),
            _ => None,
        }
    }
}

/// Immutable view of a request record, taken when a generation begins.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    pub conditioning: Conditioning,
}

/// The mutable request state of a session. Built once from the command line and updated in
/// place between interactive generations.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestRecord {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub output: PathBuf,
    pub seed: u64,
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub conditioning: Conditioning,
}

impl RequestRecord {
    /// A record with default sampling parameters. A seed is drawn when none is given.
    pub fn new(
        prompt: impl Into<String>,
        output: impl Into<PathBuf>,
        seed: Option<u64>,
        conditioning: Conditioning,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            output: output.into(),
            seed: seed.unwrap_or_else(draw_seed),
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            width: None,
            height: None,
            conditioning,
        }
    }

    pub fn mode(&self) -> Mode {
        self.conditioning.mode()
    }

    /// Replaces one field with a value read from the input stream. The value is taken verbatim.
    pub fn set(&mut self, field: Field, value: String) -> Result<(), SessionError> {
        let mode = self.mode();
        match (field, &mut self.conditioning) {
            (Field::Prompt, _) => self.prompt = value,
            (Field::Output, _) => self.output = PathBuf::from(value),
            (
                Field::InitImage,
                Conditioning::ImageToImage { init_image, .. }
                | Conditioning::Inpaint { init_image, .. },
            ) => *init_image = PathBuf::from(value),
            (Field::Mask, Conditioning::Inpaint { mask, .. }) => *mask = PathBuf::from(value),
            (field, _) => return Err(SessionError::UnsupportedField { field, mode }),
        }
        Ok(())
    }

    pub fn advance_seed(&mut self) {
        self.seed = self.seed.wrapping_add(1);
    }

    /// Copies the current values into a [`GenerationRequest`], checking that the conditioning
    /// images exist so a bad path fails before anything is generated or written.
    pub fn snapshot(&self) -> Result<GenerationRequest, SessionError> {
        let inputs = [
            (Field::InitImage, self.conditioning.init_image()),
            (Field::Mask, self.conditioning.mask()),
        ];
        for (field, path) in inputs {
            if let Some(path) = path {
                if !path.is_file() {
                    return Err(SessionError::MissingInput {
                        field,
                        path: path.to_path_buf(),
                    });
                }
            }
        }

        Ok(GenerationRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            width: self.width,
            height: self.height,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
            conditioning: self.conditioning.clone(),
        })
    }
}
