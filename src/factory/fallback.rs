use std::path::Path;

use async_trait::async_trait;

use crate::errors::{FactoryError, FactoryResult};

const DEFAULT_TITLE: &str = "Your AI powered workspace";
const ENTRY_FILE: &str = "index.html";

/// Local generator used when no agent backend can produce a project.
/// Returns the entry point relative to `workspace_root`.
#[async_trait]
pub trait FallbackGenerator: Send + Sync {
    async fn generate(&self, workspace_root: &Path, prompt: &str) -> FactoryResult<String>;
}

/// Writes a minimal static page (`index.html`, `style.css`, `app.js`).
#[derive(Debug, Clone, Default)]
pub struct StaticScaffoldGenerator;

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn index_html(prompt: &str) -> String {
    let title = match prompt.trim() {
        "" => DEFAULT_TITLE.to_string(),
        p => escape_html(p),
    };
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{title}</title>
    <link rel="stylesheet" href="style.css" />
  </head>
  <body>
    <main>
      <h1>{title}</h1>
      <p class="description">
        This page was scaffolded locally because the code generation agent was not available.
        Send another message to regenerate it.
      </p>
      <section>
        <form id="note-form">
          <input id="note-input" type="text" placeholder="Jot down a feature idea..." />
          <button type="submit">Add</button>
        </form>
        <ul id="note-list"></ul>
      </section>
    </main>
    <script src="app.js" type="module"></script>
  </body>
</html>
"#
    )
}

const STYLE_CSS: &str = r#"body {
  font-family: system-ui, -apple-system, sans-serif;
  margin: 0;
  background: #f8fafc;
  color: #0f172a;
}

main {
  max-width: 720px;
  margin: 48px auto;
  padding: 32px;
  background: white;
  border-radius: 16px;
  box-shadow: 0 16px 32px rgba(15, 23, 42, 0.1);
}

button {
  padding: 8px 16px;
  border: none;
  border-radius: 8px;
  background: #4f46e5;
  color: white;
  cursor: pointer;
}
"#;

const APP_JS: &str = r#"const notes = []

function render() {
  const list = document.querySelector('#note-list')
  list.innerHTML = ''
  for (const note of notes) {
    const li = document.createElement('li')
    li.textContent = note
    list.appendChild(li)
  }
}

document.addEventListener('DOMContentLoaded', () => {
  const form = document.querySelector('#note-form')
  const input = document.querySelector('#note-input')
  form.addEventListener('submit', (event) => {
    event.preventDefault()
    const value = input.value.trim()
    if (!value) return
    notes.push(value)
    input.value = ''
    render()
  })
})
"#;

#[async_trait]
impl FallbackGenerator for StaticScaffoldGenerator {
    async fn generate(&self, workspace_root: &Path, prompt: &str) -> FactoryResult<String> {
        let write = |name: &'static str, body: String| {
            let path = workspace_root.join(name);
            async move {
                tokio::fs::write(&path, body).await.map_err(|e| {
                    FactoryError::FallbackFailed(format!("failed to write {}: {}", path.display(), e))
                })
            }
        };
        tokio::fs::create_dir_all(workspace_root)
            .await
            .map_err(|e| FactoryError::FallbackFailed(e.to_string()))?;
        write(ENTRY_FILE, index_html(prompt)).await?;
        write("style.css", STYLE_CSS.to_string()).await?;
        write("app.js", APP_JS.to_string()).await?;
        Ok(ENTRY_FILE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_scaffold_and_returns_entry() {
        let dir = tempfile::tempdir().unwrap();
        let entry = StaticScaffoldGenerator
            .generate(dir.path(), "Recipe box")
            .await
            .unwrap();
        assert_eq!(entry, "index.html");
        let html = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert!(html.contains("<title>Recipe box</title>"));
        assert!(html.contains("<h1>Recipe box</h1>"));
        assert!(dir.path().join("style.css").is_file());
        assert!(dir.path().join("app.js").is_file());
    }

    #[tokio::test]
    async fn test_blank_prompt_uses_default_title() {
        let dir = tempfile::tempdir().unwrap();
        StaticScaffoldGenerator.generate(dir.path(), "   ").await.unwrap();
        let html = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert!(html.contains("<h1>Your AI powered workspace</h1>"));
    }

    #[test]
    fn test_prompt_is_html_escaped() {
        let html = index_html("<script>alert('x')</script> & co");
        assert!(html.contains("&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt; &amp; co"));
        assert!(!html.contains("<script>alert"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unwritable_root_is_fallback_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let err = StaticScaffoldGenerator
            .generate(&blocker.join("nested"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::FallbackFailed(_)));
    }
}
