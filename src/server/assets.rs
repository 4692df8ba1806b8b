//! Embedded index page and static assets
//!
//! The real desktop UI ships its own template; this embedded page keeps
//! the HTTP surface complete and is what the desktop shell loads by
//! default. Assets are compiled into the binary with `include_str!`.

use crate::config::Config;

/// Index page template; placeholders are filled per request.
const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Client-side event wiring.
pub const APP_JS: &str = include_str!("../assets/app.js");

/// Page styling.
pub const STYLE_CSS: &str = include_str!("../assets/style.css");

/// Renders the index page with the server's default settings.
pub fn render_index(config: &Config) -> String {
    INDEX_HTML
        .replace("{{DEFAULT_STEPS}}", &config.server.default_steps.to_string())
        .replace(
            "{{DEFAULT_CFG}}",
            &format!("{:.1}", config.server.default_cfg),
        )
        .replace("{{MODEL}}", &config.provider.ollama.model)
}

/// Looks up a static asset by file name.
pub fn static_asset(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        "app.js" => Some((APP_JS, "application/javascript")),
        "style.css" => Some((STYLE_CSS, "text/css")),
        _ => None,
    }
}
