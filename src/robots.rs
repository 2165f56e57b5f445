//! Minimal robots.txt evaluation for the crawler.
//!
//! Parses user-agent groups with Allow/Disallow rules and answers "may
//! this agent fetch this path" with longest-prefix-match semantics, ties
//! going to Allow. A missing or unreadable robots.txt means everything
//! is allowed; the crawler caches one parsed policy per origin.

#[derive(Debug, Clone, PartialEq)]
enum Rule {
    Allow(String),
    Disallow(String),
}

#[derive(Debug, Clone)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    groups: Vec<Group>,
}

impl RobotsPolicy {
    pub fn parse(text: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current: Option<Group> = None;
        // Consecutive user-agent lines share the group that follows them.
        let mut collecting_agents = false;

        for raw_line in text.lines() {
            let line = match raw_line.split('#').next() {
                Some(l) => l.trim(),
                None => continue,
            };
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();

            match key.as_str() {
                "user-agent" => {
                    if !collecting_agents {
                        if let Some(group) = current.take() {
                            groups.push(group);
                        }
                        current = Some(Group {
                            agents: Vec::new(),
                            rules: Vec::new(),
                        });
                        collecting_agents = true;
                    }
                    if let Some(group) = current.as_mut() {
                        group.agents.push(value.to_lowercase());
                    }
                }
                "allow" | "disallow" => {
                    collecting_agents = false;
                    if let Some(group) = current.as_mut() {
                        if key == "allow" {
                            if !value.is_empty() {
                                group.rules.push(Rule::Allow(value));
                            }
                        } else if value.is_empty() {
                            // Empty Disallow permits everything.
                        } else {
                            group.rules.push(Rule::Disallow(value));
                        }
                    }
                }
                _ => {
                    // crawl-delay, sitemap, and friends are ignored here.
                    collecting_agents = false;
                }
            }
        }
        if let Some(group) = current.take() {
            groups.push(group);
        }

        Self { groups }
    }

    /// Whether `user_agent` may fetch `path`. The most specific matching
    /// group applies (exact product-token match beats the `*` group);
    /// within it the longest matching rule wins, Allow on ties.
    pub fn allows(&self, user_agent: &str, path: &str) -> bool {
        let path = if path.is_empty() { "/" } else { path };
        let agent_token = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .to_lowercase();

        let group = self
            .groups
            .iter()
            .find(|g| g.agents.iter().any(|a| a != "*" && agent_token.contains(a)))
            .or_else(|| self.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")));

        let Some(group) = group else {
            return true;
        };

        let mut verdict = true;
        let mut best_len = 0usize;
        for rule in &group.rules {
            let (allow, prefix) = match rule {
                Rule::Allow(p) => (true, p),
                Rule::Disallow(p) => (false, p),
            };
            if path.starts_with(prefix.as_str()) {
                let len = prefix.len();
                if len > best_len || (len == best_len && allow) {
                    best_len = len;
                    verdict = allow;
                }
            }
        }
        verdict
    }
}
