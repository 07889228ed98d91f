use serde::{Deserialize, Serialize};
use tempo_fanout::FanOutSubject;

/// Someone a weekly plan is generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub focus_domains: Vec<String>,
}

impl Subject {
  pub fn new(
    id: impl Into<String>,
    name: impl Into<String>,
    focus_domains: impl IntoIterator<Item = impl Into<String>>,
  ) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      focus_domains: focus_domains.into_iter().map(Into::into).collect(),
    }
  }
}

impl FanOutSubject for Subject {
  fn subject_id(&self) -> &str {
    &self.id
  }
}
