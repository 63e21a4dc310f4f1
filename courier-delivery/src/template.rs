//! Per-campaign message templates.
//!
//! A campaign's body, optional layout, subject and plaintext alternative are
//! compiled once into a single `minijinja` environment. Rendering then runs
//! the compiled templates against a context holding `campaign` and
//! `subscriber`, plus the tracking functions:
//!
//! | function             | result                                        |
//! |----------------------|-----------------------------------------------|
//! | `track_link(url)`    | click-tracked URL, registered on first use    |
//! | `track_view()`       | invisible view-tracking pixel                 |
//! | `unsubscribe_url()`  | unsubscribe page of the subscriber            |
//! | `manage_url()`       | subscription preferences page                 |
//! | `optin_url()`        | double opt-in confirmation page               |
//! | `message_url()`      | web version of the message                    |
//! | `archive_url()`      | public campaign archive                       |
//! | `date(format)`       | current UTC time in `strftime` format         |
//!
//! `https://example.com@TrackLink` is accepted as shorthand for
//! `{{ track_link("https://example.com") }}` since rich text editors mangle
//! template tags inside `href` attributes.

use std::{
    fmt::Write,
    sync::{Arc, LazyLock},
};

use chrono::Utc;
use courier_common::{Campaign, Subscriber};
use minijinja::{AutoEscape, Environment, Error, ErrorKind, State, UndefinedBehavior, Value, context};
use regex::Regex;

use crate::{error::CampaignError, links::LinkTracker};

const BODY: &str = "body";
const LAYOUT: &str = "layout";
const SUBJECT: &str = "subject";
const ALT_BODY: &str = "alt_body";

static TRACK_LINK_SHORTHAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(https?://[^\s"'<>]+?)@TrackLink"#).expect("shorthand pattern is valid")
});

/// Output of a single render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
    pub alt_body: Option<String>,
}

pub struct CampaignTemplate {
    env: Environment<'static>,
    campaign: Arc<Campaign>,
    campaign_value: Value,
    has_layout: bool,
    has_subject: bool,
    has_alt_body: bool,
}

fn is_templated(source: &str) -> bool {
    source.contains("{{") || source.contains("{%")
}

fn rewrite_shorthand(source: &str) -> String {
    TRACK_LINK_SHORTHAND
        .replace_all(source, r#"{{ track_link("$1") }}"#)
        .into_owned()
}

/// The `uuid` attribute of a context object, as a string.
fn context_uuid(state: &State, name: &str) -> Result<String, Error> {
    let value = state.lookup(name).ok_or_else(|| {
        Error::new(
            ErrorKind::UndefinedError,
            format!("{name} is missing from the render context"),
        )
    })?;

    value
        .get_attr("uuid")?
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| Error::new(ErrorKind::InvalidOperation, format!("{name}.uuid is not a string")))
}

/// URLs are generated from ids or written by the campaign author, so they
/// are inserted unescaped.
fn register_functions(env: &mut Environment<'static>, links: &Arc<LinkTracker>) {
    let tracker = Arc::clone(links);
    env.add_function(
        "track_link",
        move |state: &State, url: String| -> Result<Value, Error> {
            let campaign = context_uuid(state, "campaign")?;
            let subscriber = context_uuid(state, "subscriber")?;
            Ok(Value::from_safe_string(
                tracker.resolve(&url, &campaign, &subscriber),
            ))
        },
    );

    let urls = links.urls().clone();
    env.add_function("track_view", move |state: &State| -> Result<Value, Error> {
        let campaign = context_uuid(state, "campaign")?;
        let subscriber = context_uuid(state, "subscriber")?;
        Ok(Value::from_safe_string(format!(
            r#"<img src="{}" alt="" width="1" height="1" style="display:none" />"#,
            urls.view(&campaign, &subscriber)
        )))
    });

    let urls = links.urls().clone();
    env.add_function("unsubscribe_url", move |state: &State| -> Result<Value, Error> {
        Ok(Value::from_safe_string(urls.unsubscribe(
            &context_uuid(state, "campaign")?,
            &context_uuid(state, "subscriber")?,
        )))
    });

    let urls = links.urls().clone();
    env.add_function("manage_url", move |state: &State| -> Result<Value, Error> {
        Ok(Value::from_safe_string(urls.manage(
            &context_uuid(state, "campaign")?,
            &context_uuid(state, "subscriber")?,
        )))
    });

    let urls = links.urls().clone();
    env.add_function("optin_url", move |state: &State| -> Result<Value, Error> {
        Ok(Value::from_safe_string(
            urls.optin(&context_uuid(state, "subscriber")?),
        ))
    });

    let urls = links.urls().clone();
    env.add_function("message_url", move |state: &State| -> Result<Value, Error> {
        Ok(Value::from_safe_string(urls.message(
            &context_uuid(state, "campaign")?,
            &context_uuid(state, "subscriber")?,
        )))
    });

    let urls = links.urls().clone();
    env.add_function("archive_url", move || Value::from_safe_string(urls.archive()));

    env.add_function("date", |format: String| -> Result<String, Error> {
        let mut out = String::new();
        write!(out, "{}", Utc::now().format(&format)).map_err(|_| {
            Error::new(
                ErrorKind::InvalidOperation,
                format!("invalid date format {format:?}"),
            )
        })?;
        Ok(out)
    });
}

impl CampaignTemplate {
    /// Compile every template of `campaign`.
    ///
    /// # Errors
    ///
    /// [`CampaignError::TemplateCompile`] when any part fails to parse.
    pub fn compile(
        campaign: Arc<Campaign>,
        links: &Arc<LinkTracker>,
    ) -> Result<Self, CampaignError> {
        let compile_error = |e: Error| CampaignError::TemplateCompile {
            campaign: campaign.name.clone(),
            reason: e.to_string(),
        };

        let plain = campaign.content_type.is_plain();

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(move |name| match name {
            BODY | LAYOUT if !plain => AutoEscape::Html,
            _ => AutoEscape::None,
        });
        register_functions(&mut env, links);

        env.add_template_owned(BODY, rewrite_shorthand(&campaign.body))
            .map_err(compile_error)?;

        let has_layout = match campaign.template_body.as_deref() {
            Some(layout) if !layout.trim().is_empty() => {
                env.add_template_owned(LAYOUT, rewrite_shorthand(layout))
                    .map_err(compile_error)?;
                true
            }
            _ => false,
        };

        let has_subject = is_templated(&campaign.subject);
        if has_subject {
            env.add_template_owned(SUBJECT, campaign.subject.clone())
                .map_err(compile_error)?;
        }

        let has_alt_body = match campaign.alt_body.as_deref() {
            Some(alt) if !plain && is_templated(alt) => {
                env.add_template_owned(ALT_BODY, rewrite_shorthand(alt))
                    .map_err(compile_error)?;
                true
            }
            _ => false,
        };

        let campaign_value = Value::from_serialize(&*campaign);

        Ok(Self {
            env,
            campaign,
            campaign_value,
            has_layout,
            has_subject,
            has_alt_body,
        })
    }

    pub fn campaign(&self) -> &Arc<Campaign> {
        &self.campaign
    }

    /// Render the message for one subscriber.
    ///
    /// May block on link registration; call it from a blocking thread.
    ///
    /// # Errors
    ///
    /// Any template evaluation error, including undefined variables.
    pub fn render(&self, subscriber: &Subscriber) -> Result<RenderedMessage, Error> {
        let subscriber = Value::from_serialize(subscriber);
        let ctx = context! {
            campaign => self.campaign_value.clone(),
            subscriber => subscriber.clone(),
        };

        let content = self.env.get_template(BODY)?.render(&ctx)?;
        let body = if self.has_layout {
            self.env.get_template(LAYOUT)?.render(context! {
                campaign => self.campaign_value.clone(),
                subscriber => subscriber,
                content => Value::from_safe_string(content),
            })?
        } else {
            content
        };

        let subject = if self.has_subject {
            self.env.get_template(SUBJECT)?.render(&ctx)?
        } else {
            self.campaign.subject.clone()
        };

        let alt_body = if self.campaign.content_type.is_plain() {
            None
        } else if self.has_alt_body {
            Some(self.env.get_template(ALT_BODY)?.render(&ctx)?)
        } else {
            self.campaign.alt_body.clone()
        };

        Ok(RenderedMessage {
            subject,
            body,
            alt_body,
        })
    }
}
