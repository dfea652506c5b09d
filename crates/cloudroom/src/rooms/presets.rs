//! Built-in language presets for new rooms.

/// Image, default port and environment for a language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguagePreset {
    pub key: &'static str,
    pub image: &'static str,
    pub port: u16,
    pub env: &'static [&'static str],
}

const PRESETS: &[LanguagePreset] = &[
    LanguagePreset {
        key: "node",
        image: "node:18",
        port: 8080,
        env: &["NODE_ENV=development"],
    },
    LanguagePreset {
        key: "nodejs",
        image: "node:18",
        port: 8080,
        env: &["NODE_ENV=development"],
    },
    LanguagePreset {
        key: "expressjs",
        image: "node:18",
        port: 8080,
        env: &["NODE_ENV=development"],
    },
    LanguagePreset {
        key: "python",
        image: "python:3.10",
        port: 5000,
        env: &["FLASK_ENV=development"],
    },
    LanguagePreset {
        key: "cpp",
        image: "gcc:13",
        port: 8080,
        env: &[],
    },
    LanguagePreset {
        key: "java",
        image: "openjdk:17",
        port: 8080,
        env: &["JAVA_OPTS=-Xmx512m"],
    },
    LanguagePreset {
        key: "go",
        image: "golang:1.19",
        port: 8080,
        env: &[],
    },
    LanguagePreset {
        key: "reactjs",
        image: "node:18",
        port: 5173,
        env: &["HOST=0.0.0.0", "PORT=5173"],
    },
    LanguagePreset {
        key: "nextjs",
        image: "node:18",
        port: 3000,
        env: &["HOST=0.0.0.0"],
    },
];

impl LanguagePreset {
    /// Case-insensitive lookup by language key.
    pub fn lookup(language: &str) -> Option<&'static LanguagePreset> {
        PRESETS
            .iter()
            .find(|p| p.key.eq_ignore_ascii_case(language.trim()))
    }

    pub fn all() -> &'static [LanguagePreset] {
        PRESETS
    }

    pub fn env_vars(&self) -> Vec<String> {
        self.env.iter().map(|s| s.to_string()).collect()
    }
}
