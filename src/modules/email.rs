//
// Copyright (c) The NetForeman Contributors
//
// SPDX-License-Identifier: MIT
//

//! Email module: the `sendmail` action other modules' `on_error`/
//! `on_fail_or_output` lists invoke to notify an operator by email.
//!
//! Sending itself sits behind the [`EmailSender`] trait so the module's
//! settings parsing and templating logic can be tested without a
//! network-handling dependency in the loop.

use std::any::Any;

use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message as LettreMessage, SmtpTransport, Transport};

use crate::config::{ConfigError, Tree};
use crate::dispatch::{Configurator, Dispatcher, ModuleFactory};
use crate::moduleapi::{
    Action, ActionContext, ActionError, ActionSettings, ModuleApi, ModuleRunStatus,
};

pub const NAME: &str = "email";
const ACTIONS: &[&str] = &["sendmail"];
const DEFAULT_PORT: u16 = 25;
const DEFAULT_SUBJECT: &str = "Email from NetForeman";
const DEFAULT_TEXT: &str = "This is an automated email, sent from NetForeman.\n\
\n\
It was triggered by the {module} module.\n\
\n\
Message:\n\
\n\
{message}\n";

pub const FACTORY: ModuleFactory = ModuleFactory {
    name: NAME,
    actions: ACTIONS,
    load,
    parse_action,
};

/// Substitutes the `{module}` and `{message}` placeholders in a template.
/// Deliberately not a general-purpose formatter: these are the only two
/// names a sendmail template may reference.
fn render(template: &str, module: &str, message: &str) -> String {
    template.replace("{module}", module).replace("{message}", message)
}

/// A fully rendered outgoing email, independent of whatever transport
/// ends up delivering it.
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// The transport boundary for the `sendmail` action: everything above
/// this trait is pure settings/templating logic, testable without a
/// network connection.
pub trait EmailSender: Send + Sync {
    fn send(&self, server: &str, port: u16, creds: Option<(&str, &str)>, msg: &EmailMessage)
        -> Result<(), ActionError>;
}

/// Identifies NetForeman to the receiving mail server, alongside the
/// From/To/Subject/Date/Message-ID headers `lettre` fills in on its own.
#[derive(Clone)]
struct UserAgent(String);

impl Header for UserAgent {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("User-Agent")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(UserAgent(s.to_owned()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// `EmailSender` backed by `lettre`'s SMTP transport.
pub struct LettreSender;

impl EmailSender for LettreSender {
    fn send(
        &self,
        server: &str,
        port: u16,
        creds: Option<(&str, &str)>,
        msg: &EmailMessage,
    ) -> Result<(), ActionError> {
        let from: Mailbox = msg
            .from
            .parse()
            .map_err(|e| ActionError(format!("invalid from address '{}': {e}", msg.from)))?;
        let to: Mailbox = msg
            .to
            .parse()
            .map_err(|e| ActionError(format!("invalid to address '{}': {e}", msg.to)))?;

        let message = LettreMessage::builder()
            .from(from)
            .to(to)
            .subject(msg.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .header(UserAgent(format!("netforeman/{}", env!("CARGO_PKG_VERSION"))))
            .body(msg.body.clone())
            .map_err(|e| ActionError(format!("failed to build message: {e}")))?;

        let mut builder = SmtpTransport::builder_dangerous(server).port(port);
        if let Some((username, password)) = creds {
            builder = builder.credentials(Credentials::new(username.to_owned(), password.to_owned()));
        }

        builder
            .build()
            .send(&message)
            .map_err(|e| ActionError(format!("failed to send email: {e}")))?;

        Ok(())
    }
}

pub struct EmailSettings {
    from_address: String,
    to_address: String,
    server: String,
    port: u16,
    default_subject: String,
    username: Option<String>,
    password: Option<String>,
}

fn load(tree: &Tree<'_>, _configurator: &Configurator) -> Result<Box<dyn ModuleApi>, ConfigError> {
    let from_address = tree.str("from_address")?;
    let to_address = tree.str("to_address")?;
    let server = tree.str("server")?;
    let port = tree.int_or("port", DEFAULT_PORT as i64)?;
    let port = u16::try_from(port).map_err(|_| ConfigError::Invalid {
        path: tree.path.to_owned(),
        message: format!("'{port}' is not a valid port number"),
    })?;
    let default_subject = tree
        .str_opt("default_subject")?
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_owned());
    let username = tree.str_opt("username")?;
    let password = tree.str_opt("password")?;

    tracing::debug!(server, to_address = %to_address, "loaded email module");

    Ok(Box::new(EmailModule {
        settings: EmailSettings {
            from_address,
            to_address,
            server,
            port,
            default_subject,
            username,
            password,
        },
        sender: Box::new(LettreSender),
    }))
}

#[derive(Debug, Clone)]
pub struct ActionSendEmailSettings {
    action_name: String,
    text: String,
    subject: Option<String>,
}

impl ActionSettings for ActionSendEmailSettings {
    fn action_name(&self) -> &str {
        &self.action_name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn ActionSettings> {
        Box::new(self.clone())
    }
}

fn parse_action(
    action_name: &str,
    tree: &Tree<'_>,
    _configurator: &Configurator,
) -> Result<Box<dyn ActionSettings>, ConfigError> {
    let text = tree.str_opt("text")?.unwrap_or_else(|| DEFAULT_TEXT.to_owned());
    let subject = tree.str_opt("subject")?;

    // exercise the substitution now so a malformed template is rejected
    // at configure time rather than when the action actually fires
    let _ = render(&text, "", "");

    Ok(Box::new(ActionSendEmailSettings {
        action_name: format!("{NAME}.{action_name}"),
        text,
        subject,
    }))
}

struct SendmailAction<'a> {
    module: &'a EmailModule,
    settings: ActionSendEmailSettings,
}

impl<'a> Action for SendmailAction<'a> {
    fn execute(&self, context: &ActionContext) -> Result<(), ActionError> {
        let settings = &self.module.settings;
        tracing::info!(calling_module = %context.calling_module, "sending email");

        let body = render(&self.settings.text, &context.calling_module, &context.message);
        let subject = self
            .settings
            .subject
            .clone()
            .unwrap_or_else(|| settings.default_subject.clone());

        let msg = EmailMessage {
            from: settings.from_address.clone(),
            to: settings.to_address.clone(),
            subject,
            body,
        };

        let creds = match (&settings.username, &settings.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        };

        self.module.sender.send(&settings.server, settings.port, creds, &msg)
    }
}

pub struct EmailModule {
    settings: EmailSettings,
    sender: Box<dyn EmailSender>,
}

impl ModuleApi for EmailModule {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, _dispatch: &Dispatcher) -> ModuleRunStatus {
        ModuleRunStatus::Ok
    }

    fn make_action<'a>(
        &'a self,
        action_name: &str,
        settings: &dyn ActionSettings,
        _dispatch: &'a Dispatcher,
    ) -> Result<Box<dyn Action + 'a>, ActionError> {
        if action_name != "sendmail" {
            return Err(ActionError(format!("no such email action '{action_name}'")));
        }
        let settings = settings
            .as_any()
            .downcast_ref::<ActionSendEmailSettings>()
            .ok_or_else(|| ActionError::from("settings type mismatch for email action"))?
            .clone();
        Ok(Box::new(SendmailAction { module: self, settings }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn render_substitutes_placeholders() {
        let out = render("from {module}: {message}", "fib_linux", "route missing");
        assert_eq!(out, "from fib_linux: route missing");
    }

    #[test]
    fn render_leaves_unknown_text_untouched() {
        let out = render("nothing to substitute here", "fib_linux", "route missing");
        assert_eq!(out, "nothing to substitute here");
    }

    struct RecordingSender {
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl EmailSender for RecordingSender {
        fn send(
            &self,
            _server: &str,
            _port: u16,
            _creds: Option<(&str, &str)>,
            msg: &EmailMessage,
        ) -> Result<(), ActionError> {
            self.sent.lock().unwrap().push(msg.body.clone());
            Ok(())
        }
    }

    #[test]
    fn sendmail_action_renders_and_dispatches_to_sender() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let module = EmailModule {
            settings: EmailSettings {
                from_address: "alerts@example.com".to_owned(),
                to_address: "ops@example.com".to_owned(),
                server: "localhost".to_owned(),
                port: DEFAULT_PORT,
                default_subject: DEFAULT_SUBJECT.to_owned(),
                username: None,
                password: None,
            },
            sender: Box::new(RecordingSender { sent: Arc::clone(&sent) }),
        };

        let action = SendmailAction {
            module: &module,
            settings: ActionSendEmailSettings {
                action_name: "email.sendmail".to_owned(),
                text: "triggered by {module}: {message}".to_owned(),
                subject: None,
            },
        };

        let context = ActionContext::new("fib_linux", "route to 0.0.0.0/0 not found");
        action.execute(&context).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], "triggered by fib_linux: route to 0.0.0.0/0 not found");
    }
}
