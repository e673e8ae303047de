//! Runtime image definitions.
//!
//! Every (language, backend) pair gets its own tag built from a fixed base
//! image. The generated Dockerfile is fingerprinted and the fingerprint is
//! stored as an image label, so a changed definition is detected as a
//! missing image and rebuilt.

use sandbox::{Backend, Language};
use sha2::{Digest, Sha256};

use crate::config::DockerConfig;

/// Label carrying the definition fingerprint.
pub(crate) const DEFINITION_LABEL: &str = "faas.definition";

/// Working directory inside every runtime image.
pub(crate) const WORKDIR: &str = "/sandbox";

/// Unprivileged user code runs as.
pub(crate) const SANDBOX_USER: &str = "sandbox";

pub(crate) fn image_tag(prefix: &str, language: Language, backend: Backend) -> String {
    format!("{prefix}-{language}:{backend}")
}

/// A fully rendered image definition for one pair.
pub(crate) struct ImageDefinition {
    pub tag: String,
    pub dockerfile: String,
    pub fingerprint: String,
}

impl ImageDefinition {
    pub fn new(config: &DockerConfig, language: Language, backend: Backend) -> Self {
        let base = match language {
            Language::Python => config.python_base_image.as_str(),
            Language::Node => config.node_base_image.as_str(),
        };
        let body = render_body(base, language, backend);
        let fingerprint = fingerprint(&body);
        let dockerfile = format!("{body}LABEL {DEFINITION_LABEL}=\"{fingerprint}\"\n");
        Self {
            tag: image_tag(&config.image_prefix, language, backend),
            dockerfile,
            fingerprint,
        }
    }

    /// In-memory tar archive holding only the Dockerfile.
    pub fn build_context(&self) -> std::io::Result<Vec<u8>> {
        let bytes = self.dockerfile.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_data(&mut header, "Dockerfile", bytes)?;
        builder.into_inner()
    }
}

fn render_body(base: &str, language: Language, backend: Backend) -> String {
    let env = match language {
        Language::Python => "ENV PYTHONDONTWRITEBYTECODE=1 PYTHONUNBUFFERED=1\n",
        Language::Node => "ENV NODE_ENV=production\n",
    };
    format!(
        "FROM {base}\n\
         LABEL faas.language=\"{language}\" faas.backend=\"{backend}\"\n\
         RUN useradd --create-home --uid 10001 --shell /usr/sbin/nologin {SANDBOX_USER} \\\n \
         && mkdir -p {WORKDIR} && chown {SANDBOX_USER}:{SANDBOX_USER} {WORKDIR}\n\
         {env}\
         WORKDIR {WORKDIR}\n\
         USER {SANDBOX_USER}\n\
         CMD [\"sleep\", \"infinity\"]\n"
    )
}

fn fingerprint(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Interpreter argv running `code` directly, without a shell.
pub(crate) fn interpreter_command(language: Language, code: &str) -> Vec<String> {
    match language {
        Language::Python => vec!["python3".into(), "-u".into(), "-c".into(), code.into()],
        Language::Node => vec!["node".into(), "-e".into(), code.into()],
    }
}
