use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub bot: BotConfig,
    /// Bare JIDs of MUC rooms to join at startup. Top-level key: in TOML
    /// it must appear before the first table header.
    #[serde(default)]
    pub rooms: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bot account JID, e.g. "bot@example.com"
    pub jid: String,
    /// Supports ${ENV_VAR} substitution
    pub password: String,
    /// Defaults to the JID's domain
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Set to false for self-signed certs (dev servers)
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    /// Nickname used in every joined room
    pub nick: String,
    /// Per-query IQ deadline
    #[serde(default = "default_iq_timeout")]
    pub iq_timeout_secs: u64,
}

fn default_port() -> u16 {
    5222
}

fn default_resource() -> String {
    "xmpptools".to_string()
}

fn default_tls_verify() -> bool {
    true
}

fn default_iq_timeout() -> u64 {
    30
}

impl ServerConfig {
    /// The account's domain part.
    pub fn domain(&self) -> Option<&str> {
        self.jid.split('@').nth(1).filter(|d| !d.is_empty())
    }

    /// host:port to dial, defaulting the host to the JID domain.
    pub fn addr(&self) -> String {
        let host = self
            .host
            .as_deref()
            .or_else(|| self.domain())
            .unwrap_or(&self.jid);
        format!("{}:{}", host, self.port)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML after expanding environment references like ${BOT_PASSWORD}.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        if config.server.domain().is_none() {
            anyhow::bail!("server.jid must be of the form user@domain: {}", config.server.jid);
        }
        if config.bot.nick.trim().is_empty() {
            anyhow::bail!("bot.nick must not be empty");
        }
        Ok(config)
    }
}
