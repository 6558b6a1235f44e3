//! Console producer — writes message payloads to stdout or stderr.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use manifold_api::config::PluginConfigReader;
use manifold_api::error::SinkError;
use manifold_api::message::Message;
use manifold_api::plugin::ProducerPlugin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Stdout,
    Stderr,
}

pub struct ConsoleProducer {
    target: Target,
    newline: bool,
}

impl Default for ConsoleProducer {
    fn default() -> Self {
        Self {
            target: Target::Stdout,
            newline: true,
        }
    }
}

#[async_trait]
impl ProducerPlugin for ConsoleProducer {
    fn configure(&mut self, reader: &mut PluginConfigReader<'_>) {
        let console = reader.get_str("Console", "stdout");
        self.target = match console.to_ascii_lowercase().as_str() {
            "stdout" => Target::Stdout,
            "stderr" => Target::Stderr,
            other => {
                reader
                    .errors()
                    .push_fatal(format!("option 'Console': expected stdout or stderr, got '{other}'"));
                Target::Stdout
            }
        };
        self.newline = reader.get_bool("Newline", true);
    }

    async fn on_message(&mut self, msg: &Message) -> Result<(), SinkError> {
        let mut data = Vec::with_capacity(msg.payload.len() + 1);
        data.extend_from_slice(&msg.payload);
        if self.newline {
            data.push(b'\n');
        }

        let result = match self.target {
            Target::Stdout => tokio::io::stdout().write_all(&data).await,
            Target::Stderr => tokio::io::stderr().write_all(&data).await,
        };
        result.map_err(SinkError::fatal)
    }
}

/// Register the console producer under its qualified type name.
pub fn register() {
    manifold_engine::registry::register_producer("manifold.producer.Console", || {
        Box::new(ConsoleProducer::default())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_api::config::PluginConfig;

    #[test]
    fn bad_console_target_is_fatal() {
        let config = PluginConfig::new("producer.Console").with("Console", "printer");
        let mut plugin = ConsoleProducer::default();
        let mut reader = PluginConfigReader::new(&config);
        plugin.configure(&mut reader);
        assert!(reader.into_errors().has_fatal());
    }

    #[test]
    fn stderr_target_is_accepted() {
        let config = PluginConfig::new("producer.Console").with("Console", "STDERR");
        let mut plugin = ConsoleProducer::default();
        let mut reader = PluginConfigReader::new(&config);
        plugin.configure(&mut reader);
        assert!(reader.into_errors().is_empty());
        assert_eq!(plugin.target, Target::Stderr);
    }
}
