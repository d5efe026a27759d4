//! Startup configuration.
//!
//! Parsed once from the command line before anything touches the display.
//! The locker core only consumes the plugin-enablement subset; colors and
//! timeouts are read by the rendering and timer layers.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Shell command for the background generator plugin. `None` disables
    /// the embedded server entirely.
    pub plugin_command: Option<String>,
    /// Solid background color (0xRRGGBB) used when no plugin is drawing.
    pub color: u32,
    /// Submitting an empty password is ignored instead of validated.
    pub ignore_empty: bool,
    /// Surface the failed-attempt counter to the indicator collaborator.
    pub show_failed_attempts: bool,
    /// How long transient indicator states stay visible.
    pub indicator_clear_after: Duration,
    /// Erases an abandoned half-typed password.
    pub password_clear_after: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin_command: None,
            color: 0x000000,
            ignore_empty: false,
            show_failed_attempts: false,
            indicator_clear_after: Duration::from_secs(1),
            password_clear_after: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Parse command-line arguments. Unknown flags are an error so typos
    /// in a lock command never silently weaken it.
    pub fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut config = Self::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--plugin-command" | "-p" => {
                    let cmd = args.next().ok_or("--plugin-command needs a value")?;
                    config.plugin_command = Some(cmd);
                }
                "--color" | "-c" => {
                    let value = args.next().ok_or("--color needs a value")?;
                    config.color = parse_color(&value)?;
                }
                "--ignore-empty-password" | "-e" => config.ignore_empty = true,
                "--show-failed-attempts" | "-F" => config.show_failed_attempts = true,
                "--help" | "-h" => return Err(USAGE.to_string()),
                other => return Err(format!("unknown argument: {other}\n{USAGE}")),
            }
        }

        Ok(config)
    }
}

const USAGE: &str = "\
usage: lockgate [options]
  -p, --plugin-command <cmd>   run <cmd> as the background generator
  -c, --color <rrggbb>         solid background color
  -e, --ignore-empty-password  ignore enter on an empty password
  -F, --show-failed-attempts   log the failed attempt count";

fn parse_color(value: &str) -> Result<u32, String> {
    let hex = value.trim_start_matches('#');
    if hex.len() != 6 {
        return Err(format!("invalid color {value:?}, expected rrggbb"));
    }
    u32::from_str_radix(hex, 16).map_err(|e| format!("invalid color {value:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, String> {
        Config::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert!(config.plugin_command.is_none());
        assert!(!config.ignore_empty);
        assert_eq!(config.color, 0x000000);
    }

    #[test]
    fn test_plugin_command_and_color() {
        let config = parse(&["-p", "swaybg-shader", "--color", "#203040"]).unwrap();
        assert_eq!(config.plugin_command.as_deref(), Some("swaybg-shader"));
        assert_eq!(config.color, 0x203040);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(parse(&["--daemonizee"]).is_err());
    }

    #[test]
    fn test_bad_color_is_rejected() {
        assert!(parse(&["-c", "red"]).is_err());
    }
}
