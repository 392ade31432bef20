use std::env;
use std::sync::OnceLock;

use crate::backend::passes::GatherExpanderMode;

static PTIR_GATHER_EXPANDER_MODE: OnceLock<Option<GatherExpanderMode>> = OnceLock::new();

pub(crate) fn gather_expander_mode() -> Option<GatherExpanderMode> {
    *PTIR_GATHER_EXPANDER_MODE.get_or_init(|| match env::var("PTIR_GATHER_EXPANDER_MODE") {
        Ok(value) if !value.trim().is_empty() => match value.parse() {
            Ok(mode) => Some(mode),
            Err(err) => {
                tracing::warn!(%err, "ignoring PTIR_GATHER_EXPANDER_MODE");
                None
            }
        },
        _ => None,
    })
}
