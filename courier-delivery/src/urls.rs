/// Builds the public URLs embedded in campaign messages.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    root: String,
    individual_tracking: bool,
}

impl UrlBuilder {
    pub fn new(root: impl Into<String>, individual_tracking: bool) -> Self {
        let root: String = root.into();

        Self {
            root: root.trim_end_matches('/').to_string(),
            individual_tracking,
        }
    }

    /// Subscriber id used in click and view tracking. Anonymous tracking
    /// attributes every event to the nil UUID.
    pub fn tracked_subscriber<'a>(&self, subscriber: &'a str) -> &'a str {
        const ANONYMOUS: &str = "00000000-0000-0000-0000-000000000000";

        if self.individual_tracking {
            subscriber
        } else {
            ANONYMOUS
        }
    }

    pub fn link(&self, link: &str, campaign: &str, subscriber: &str) -> String {
        format!(
            "{}/link/{link}/{campaign}/{}",
            self.root,
            self.tracked_subscriber(subscriber)
        )
    }

    pub fn view(&self, campaign: &str, subscriber: &str) -> String {
        format!(
            "{}/campaign/{campaign}/{}/px.png",
            self.root,
            self.tracked_subscriber(subscriber)
        )
    }

    pub fn unsubscribe(&self, campaign: &str, subscriber: &str) -> String {
        format!("{}/subscription/{campaign}/{subscriber}", self.root)
    }

    pub fn manage(&self, campaign: &str, subscriber: &str) -> String {
        format!("{}?manage=true", self.unsubscribe(campaign, subscriber))
    }

    pub fn optin(&self, subscriber: &str) -> String {
        format!("{}/subscription/optin/{subscriber}", self.root)
    }

    pub fn message(&self, campaign: &str, subscriber: &str) -> String {
        format!("{}/campaign/{campaign}/{subscriber}", self.root)
    }

    pub fn archive(&self) -> String {
        format!("{}/archive", self.root)
    }
}

impl Default for UrlBuilder {
    fn default() -> Self {
        Self::new("http://localhost:9000", false)
    }
}
