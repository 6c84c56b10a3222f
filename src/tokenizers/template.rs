use std::fmt::Write;

/// Chat template wrapped around an edit instruction before tokenization.
#[derive(Debug, Clone)]
pub struct EditPromptTemplate {
    system: String,
}

impl EditPromptTemplate {
    const SYSTEM: &'static str = "Describe the key features of the input image \
        (color, shape, size, texture, objects, background), then explain how the user's text \
        instruction should alter or modify the image. Generate a new image that meets the \
        user's requirements while maintaining consistency with the original input image, \
        where appropriate.";

    pub fn with_system(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }

    /// Renders the instruction with one vision placeholder per conditioning image.
    pub fn render(&self, instruction: &str, images: usize) -> String {
        let mut out = format!("<|im_start|>system\n{}<|im_end|>\n<|im_start|>user\n", self.system);
        for i in 1..=images {
            // writing into a String cannot fail
            let _ = write!(out, "Picture {i}: <|vision_start|><|image_pad|><|vision_end|>");
        }
        out.push_str(instruction);
        out.push_str("<|im_end|>\n<|im_start|>assistant\n");
        out
    }
}

impl Default for EditPromptTemplate {
    fn default() -> Self {
        Self::with_system(Self::SYSTEM)
    }
}
