//! Content path resolution under environment priority.
//!
//! Every content item resolves against one *winning* environment: the first
//! environment in the consumer's priority list that promotes it. The same
//! [`winner`] function drives both path building here and dirty detection in
//! [`crate::content::regeneration`], so a path change and a dirty flag always
//! happen together.

use crate::types::{Content, Environment, Owner};

/// Token in an owner prefix replaced by the winning environment's name.
pub const ENVIRONMENT_TOKEN: &str = "$env";

/// Something that promotes content, ordered by the caller.
pub trait PromotionScope {
    fn scope_id(&self) -> &str;
    fn promotes(&self, content_id: &str) -> bool;
}

impl PromotionScope for Environment {
    fn scope_id(&self) -> &str {
        &self.id
    }

    fn promotes(&self, content_id: &str) -> bool {
        self.contents.contains_key(content_id)
    }
}

/// First scope in `ordering` promoting `content_id`.
pub fn winner<'a, S: PromotionScope>(ordering: &'a [S], content_id: &str) -> Option<&'a S> {
    ordering.iter().find(|scope| scope.promotes(content_id))
}

/// URL-encode a single path segment. `$` survives so clients can still
/// substitute `$releasever`, `$basearch` or an unresolved `$env`.
pub fn encode_segment(segment: &str) -> String {
    urlencoding::encode(segment).replace("%24", "$")
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Encode every non-empty segment of an owner prefix, always starting and
/// ending with `/`.
pub fn clean_up_prefix(prefix: &str) -> String {
    let mut output = String::from("/");
    for part in segments(prefix) {
        output.push_str(&encode_segment(part));
        output.push('/');
    }
    output
}

/// Joins an owner prefix, optionally naming an environment, with content URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentPathBuilder {
    prefix: Option<String>,
}

impl ContentPathBuilder {
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string),
        }
    }

    /// The owner's prefix, falling back to `default_prefix` when it has none.
    pub fn for_owner(owner: &Owner, default_prefix: Option<&str>) -> Self {
        Self::new(owner.content_prefix.as_deref().or(default_prefix))
    }

    pub fn references_environment(&self) -> bool {
        self.prefix
            .as_deref()
            .map(|p| p.contains(ENVIRONMENT_TOKEN))
            .unwrap_or(false)
    }

    /// Prefix with the environment substituted and every segment encoded.
    pub fn prefix_for(&self, environment: Option<&Environment>) -> Option<String> {
        let prefix = self.prefix.as_deref()?;
        let prefix = match environment {
            Some(env) => prefix.replace(ENVIRONMENT_TOKEN, &env.name),
            None => prefix.to_string(),
        };
        Some(clean_up_prefix(&prefix))
    }

    /// Full content path. Absolute URLs are returned untouched.
    pub fn build(&self, environment: Option<&Environment>, content_url: &str) -> String {
        if content_url.contains("://") {
            return content_url.to_string();
        }

        let prefix = self.prefix_for(environment).unwrap_or_default();
        let parts: Vec<String> = segments(&prefix)
            .map(str::to_string)
            .chain(segments(content_url).map(encode_segment))
            .collect();
        format!("/{}", parts.join("/"))
    }
}

/// Content promotions across a consumer's environments, highest priority first.
#[derive(Debug, Clone)]
pub struct PromotedContent<'a> {
    paths: ContentPathBuilder,
    environments: &'a [Environment],
}

impl<'a> PromotedContent<'a> {
    pub fn new(paths: ContentPathBuilder, environments: &'a [Environment]) -> Self {
        Self {
            paths,
            environments,
        }
    }

    /// No environments: every path is built from the prefix alone.
    pub fn unscoped(paths: ContentPathBuilder) -> PromotedContent<'static> {
        PromotedContent {
            paths,
            environments: &[],
        }
    }

    pub fn environments(&self) -> &'a [Environment] {
        self.environments
    }

    pub fn path_builder(&self) -> &ContentPathBuilder {
        &self.paths
    }

    pub fn winner(&self, content_id: &str) -> Option<&'a Environment> {
        winner(self.environments, content_id)
    }

    pub fn is_promoted(&self, content_id: &str) -> bool {
        self.winner(content_id).is_some()
    }

    /// Enabled flag set on the winning promotion, if it carries one.
    pub fn is_enabled(&self, content_id: &str) -> Option<bool> {
        self.winner(content_id)
            .and_then(|env| env.contents.get(content_id))
            .and_then(|promotion| promotion.enabled)
    }

    pub fn path(&self, content: &Content) -> String {
        self.paths
            .build(self.winner(&content.id), &content.content_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn environment(id: &str, name: &str, promotions: &[(&str, Option<bool>)]) -> Environment {
        let mut env = Environment::new(id, "owner-1", name);
        for (content_id, enabled) in promotions {
            env.promote(*content_id, *enabled);
        }
        env
    }

    #[test]
    fn test_clean_up_prefix_encodes_and_keeps_dollar() {
        assert_eq!(clean_up_prefix("/acme corp//$env/"), "/acme%20corp/$env/");
        assert_eq!(clean_up_prefix(""), "/");
    }

    #[test]
    fn test_build_substitutes_environment_and_strips_empty_segments() {
        let paths = ContentPathBuilder::new(Some("/org/$env/"));
        let env = Environment::new("e1", "owner-1", "dev team");
        assert!(paths.references_environment());
        assert_eq!(
            paths.build(Some(&env), "//content/dist/$releasever/os/"),
            "/org/dev%20team/content/dist/$releasever/os"
        );
        assert_eq!(paths.build(None, "/content/os"), "/org/$env/content/os");
    }

    #[test]
    fn test_build_without_prefix_and_absolute_url() {
        let paths = ContentPathBuilder::new(Some("  "));
        assert_eq!(paths.build(None, "/content/os"), "/content/os");
        assert_eq!(
            paths.build(None, "https://cdn.example.com/repo"),
            "https://cdn.example.com/repo"
        );
    }

    #[test]
    fn test_owner_prefix_falls_back_to_default() {
        let mut owner = Owner::new("owner-1", "acme");
        assert_eq!(
            ContentPathBuilder::for_owner(&owner, Some("/default")),
            ContentPathBuilder::new(Some("/default"))
        );
        owner.content_prefix = Some("/acme/$env".to_string());
        assert_eq!(
            ContentPathBuilder::for_owner(&owner, Some("/default")),
            ContentPathBuilder::new(Some("/acme/$env"))
        );
    }

    #[test]
    fn test_first_promoting_environment_wins() {
        let envs = vec![
            environment("e1", "first", &[("c2", None)]),
            environment("e2", "second", &[("c1", Some(false)), ("c2", Some(false))]),
            environment("e3", "third", &[("c1", Some(true))]),
        ];
        let promoted = PromotedContent::new(ContentPathBuilder::new(Some("/$env")), &envs);

        assert_eq!(promoted.winner("c1").map(|e| e.id.as_str()), Some("e2"));
        assert_eq!(promoted.winner("c2").map(|e| e.id.as_str()), Some("e1"));
        assert!(promoted.winner("c3").is_none());
        assert_eq!(promoted.is_enabled("c1"), Some(false));
        // e1 promotes c2 without an explicit flag
        assert_eq!(promoted.is_enabled("c2"), None);
    }

    #[test]
    fn test_unscoped_has_no_winners() {
        let promoted = PromotedContent::unscoped(ContentPathBuilder::default());
        assert!(promoted.environments().is_empty());
        assert!(!promoted.is_promoted("c1"));
        let content = Content::new("c1", "one", "/repo/one");
        assert_eq!(promoted.path(&content), "/repo/one");
    }
}
