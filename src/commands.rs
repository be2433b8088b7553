//! Slash command parsing for the chat input line.

/// Greeting and help text, shown line by line on the status channel.
pub const MOTD: &str = "\
welcome to meshchat
  /join <channel> (or /j) join a channel, no argument rejoins the current one
  /part [channel] (or /p) leave a channel
  /nick <name>    (or /n) change your nickname
  /help           (or /h) show this message
anything else is sent to the current channel";

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Join a channel, or the current one when no argument is given.
    Join(Option<String>),
    /// Part a channel, or the current one when no argument is given.
    Part(Option<String>),
    /// Change the nickname.
    Nick(String),
    /// Show the help text.
    Help,
    /// Plain text for the current channel.
    Say(String),
    /// A slash command we do not know.
    Unknown(String),
}

/// Parse one input line.
///
/// A line starting with `/` followed by a non-space token is a command;
/// the command name is case-insensitive and takes at most one argument,
/// the next whitespace-separated token. Anything else is plain text.
pub fn parse(line: &str) -> Command {
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };
    // the command token must follow the slash directly
    if rest.starts_with(char::is_whitespace) {
        return Command::Say(line.to_string());
    }
    let mut tokens = rest.split_whitespace();
    let Some(cmd) = tokens.next() else {
        // a bare "/" is not a command
        return Command::Say(line.to_string());
    };
    let arg = tokens.next().map(str::to_string);
    match cmd.to_lowercase().as_str() {
        "join" | "j" => Command::Join(arg),
        "part" | "p" => Command::Part(arg),
        "nick" | "n" => match arg {
            Some(name) => Command::Nick(name),
            None => Command::Unknown(cmd.to_string()),
        },
        "help" | "h" => Command::Help,
        _ => Command::Unknown(cmd.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_with_and_without_argument() {
        assert_eq!(parse("/join rust"), Command::Join(Some("rust".to_string())));
        assert_eq!(parse("/j rust"), Command::Join(Some("rust".to_string())));
        assert_eq!(parse("/join"), Command::Join(None));
        assert_eq!(parse("/JOIN rust"), Command::Join(Some("rust".to_string())));
    }

    #[test]
    fn part_with_and_without_argument() {
        assert_eq!(parse("/part rust"), Command::Part(Some("rust".to_string())));
        assert_eq!(parse("/p"), Command::Part(None));
    }

    #[test]
    fn nick_requires_an_argument() {
        assert_eq!(parse("/nick ada"), Command::Nick("ada".to_string()));
        assert_eq!(parse("/n ada"), Command::Nick("ada".to_string()));
        assert_eq!(parse("/nick"), Command::Unknown("nick".to_string()));
    }

    #[test]
    fn only_the_first_argument_counts() {
        assert_eq!(
            parse("/join rust extra words"),
            Command::Join(Some("rust".to_string()))
        );
    }

    #[test]
    fn unknown_commands_and_plain_text() {
        assert_eq!(parse("/frobnicate"), Command::Unknown("frobnicate".to_string()));
        assert_eq!(parse("hello world"), Command::Say("hello world".to_string()));
        // a lone slash or slash-space is plain text
        assert_eq!(parse("/"), Command::Say("/".to_string()));
        assert_eq!(parse("/ x"), Command::Say("/ x".to_string()));
        assert_eq!(parse(""), Command::Say(String::new()));
    }

    #[test]
    fn help_variants() {
        assert_eq!(parse("/help"), Command::Help);
        assert_eq!(parse("/h"), Command::Help);
    }
}
