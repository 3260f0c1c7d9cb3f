//! Request classification.
//!
//! Categories overlap (an image served from under the API prefix, a
//! cross-origin stylesheet), so rules are applied in a fixed first-match order:
//!
//! 1. non-GET → `external` (pass-through)
//! 2. path under the API prefix → `api`
//! 3. image extension or destination → `image`
//! 4. font extension or destination → `font`
//! 5. `audio` path segment, audio extension or destination → `audio`
//! 6. script/style extension or destination → `static-asset`
//! 7. document destination or an Accept header asking for HTML → `page`
//! 8. cross-origin → `external`
//! 9. anything else → `static-asset`

use serde::{Deserialize, Serialize};
use std::fmt;
use url::{Origin, Url};

use crate::http::{Destination, Request};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico", "bmp"];
const FONT_EXTENSIONS: &[&str] = &["woff", "woff2", "ttf", "otf", "eot"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "ogg", "wav", "m4a", "flac", "aac"];
const STATIC_EXTENSIONS: &[&str] = &["js", "mjs", "css", "map", "json", "wasm"];
const PAGE_EXTENSIONS: &[&str] = &["html", "htm"];

/// Resource classification used to look up the store and strategy for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
  #[serde(alias = "static")]
  StaticAsset,
  Page,
  Image,
  Font,
  Api,
  Audio,
  External,
}

impl Category {
  /// Prefix used in store names (`"{prefix}-cache-v{version}"`).
  pub fn store_prefix(&self) -> &'static str {
    match self {
      Self::StaticAsset => "static",
      Self::Page => "page",
      Self::Image => "image",
      Self::Font => "font",
      Self::Api => "api",
      Self::Audio => "audio",
      Self::External => "external",
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::StaticAsset => "static-asset",
      other => other.store_prefix(),
    };
    f.write_str(s)
  }
}

/// Maps requests to categories for a single origin.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  api_prefix: String,
}

impl Classifier {
  pub fn new(origin: &Url, api_prefix: &str) -> Self {
    Self {
      origin: origin.origin(),
      api_prefix: api_prefix.to_string(),
    }
  }

  pub fn classify(&self, request: &Request) -> Category {
    if !request.is_get() {
      return Category::External;
    }

    let path = request.url.path();
    let extension = extension(path);
    let has_ext = |list: &[&str]| extension.as_deref().is_some_and(|e| list.contains(&e));

    if path.starts_with(&self.api_prefix) {
      return Category::Api;
    }

    if request.destination == Destination::Image || has_ext(IMAGE_EXTENSIONS) {
      return Category::Image;
    }

    if request.destination == Destination::Font || has_ext(FONT_EXTENSIONS) {
      return Category::Font;
    }

    let audio_segment = request
      .url
      .path_segments()
      .is_some_and(|mut segments| segments.any(|s| s.eq_ignore_ascii_case("audio")));
    if request.destination == Destination::Audio || audio_segment || has_ext(AUDIO_EXTENSIONS) {
      return Category::Audio;
    }

    if matches!(request.destination, Destination::Script | Destination::Style)
      || has_ext(STATIC_EXTENSIONS)
    {
      return Category::StaticAsset;
    }

    let wants_html = request
      .header("accept")
      .is_some_and(|accept| accept.contains("text/html"));
    if request.destination == Destination::Document || wants_html {
      return Category::Page;
    }

    if !self.is_same_origin(&request.url) {
      return Category::External;
    }

    Category::StaticAsset
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin
  }

  /// GET request for a configured URL (warm-list entry, fallback target),
  /// shaped the way a browser would ask for it: same-origin paths with no
  /// extension or an HTML one arrive as document navigations.
  ///
  /// Warming and fallback lookups go through this so they land in the same
  /// store a real navigation reads.
  pub fn configured_request(&self, url: Url) -> Request {
    let page_like = extension(url.path()).map_or(true, |ext| PAGE_EXTENSIONS.contains(&ext.as_str()));
    let request = Request::get(url);
    if page_like && self.is_same_origin(&request.url) {
      request.with_destination(Destination::Document)
    } else {
      request
    }
  }
}

/// Lower-cased extension of the last path segment, if any.
fn extension(path: &str) -> Option<String> {
  let file = path.rsplit('/').next()?;
  let (stem, ext) = file.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    Classifier::new(&Url::parse("http://localhost:3000").unwrap(), "/api/")
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse("http://localhost:3000").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_non_get_is_external() {
    let req = Request::new("POST", Url::parse("http://localhost:3000/api/contact").unwrap());
    assert_eq!(classifier().classify(&req), Category::External);
  }

  #[test]
  fn test_api_prefix_wins_over_image_extension() {
    assert_eq!(classifier().classify(&get("/api/avatar.png")), Category::Api);
    assert_eq!(classifier().classify(&get("/api/projects")), Category::Api);
  }

  #[test]
  fn test_image_by_extension_and_destination() {
    assert_eq!(classifier().classify(&get("/logo.svg")), Category::Image);
    assert_eq!(classifier().classify(&get("/IMG/Photo.JPG")), Category::Image);
    let hinted = get("/render?id=3").with_destination(Destination::Image);
    assert_eq!(classifier().classify(&hinted), Category::Image);
  }

  #[test]
  fn test_font() {
    assert_eq!(classifier().classify(&get("/fonts/inter.woff2")), Category::Font);
  }

  #[test]
  fn test_image_wins_over_audio_segment() {
    assert_eq!(classifier().classify(&get("/audio/cover.png")), Category::Image);
    assert_eq!(classifier().classify(&get("/audio/track-01")), Category::Audio);
    assert_eq!(classifier().classify(&get("/music/theme.mp3")), Category::Audio);
  }

  #[test]
  fn test_script_and_style_are_static() {
    assert_eq!(classifier().classify(&get("/_next/app.js")), Category::StaticAsset);
    let styled = get("/theme").with_destination(Destination::Style);
    assert_eq!(classifier().classify(&styled), Category::StaticAsset);
  }

  #[test]
  fn test_page_by_destination_or_accept() {
    let doc = get("/about").with_destination(Destination::Document);
    assert_eq!(classifier().classify(&doc), Category::Page);
    let html = get("/blog").with_header("Accept", "text/html,application/xhtml+xml");
    assert_eq!(classifier().classify(&html), Category::Page);
  }

  #[test]
  fn test_cross_origin_is_external() {
    let req = Request::get(Url::parse("https://analytics.example.com/collect").unwrap());
    assert_eq!(classifier().classify(&req), Category::External);
  }

  #[test]
  fn test_cross_origin_font_keeps_font_category() {
    let req = Request::get(Url::parse("https://fonts.example.com/inter.woff2").unwrap());
    assert_eq!(classifier().classify(&req), Category::Font);
  }

  #[test]
  fn test_same_origin_fallthrough_is_static() {
    assert_eq!(classifier().classify(&get("/offline.html")), Category::StaticAsset);
    assert_eq!(classifier().classify(&get("/")), Category::StaticAsset);
  }

  #[test]
  fn test_dotfiles_and_trailing_dots_have_no_extension() {
    assert_eq!(extension("/.well-known"), None);
    assert_eq!(extension("/assets/.env"), None);
    assert_eq!(extension("/download."), None);
    assert_eq!(extension("/Logo.SVG").as_deref(), Some("svg"));
    assert_eq!(classifier().classify(&get("/.well-known")), Category::StaticAsset);
  }

  #[test]
  fn test_configured_request_matches_navigation() {
    let c = classifier();
    let origin = Url::parse("http://localhost:3000").unwrap();
    let navigation = |path: &str| get(path).with_destination(Destination::Document);

    for path in ["/", "/about", "/offline.html", "/docs/index.htm"] {
      let configured = c.configured_request(origin.join(path).unwrap());
      assert_eq!(configured.destination, Destination::Document);
      assert_eq!(c.classify(&configured), Category::Page);
      assert_eq!(c.classify(&configured), c.classify(&navigation(path)));
      assert_eq!(configured.key(), navigation(path).key());
    }

    assert_eq!(c.classify(&c.configured_request(origin.join("/app.js").unwrap())), Category::StaticAsset);
    assert_eq!(c.classify(&c.configured_request(origin.join("/logo.svg").unwrap())), Category::Image);
    assert_eq!(c.classify(&c.configured_request(origin.join("/api/me").unwrap())), Category::Api);

    let cdn = Url::parse("https://cdn.example.com/lib").unwrap();
    assert!(!c.is_same_origin(&cdn));
    assert_eq!(c.configured_request(cdn).destination, Destination::Empty);
  }

  #[test]
  fn test_classify_is_idempotent() {
    let c = classifier();
    let requests = [
      get("/logo.svg"),
      get("/api/x"),
      get("/").with_destination(Destination::Document),
      Request::get(Url::parse("https://cdn.example.com/lib").unwrap()),
    ];
    for req in &requests {
      assert_eq!(c.classify(req), c.classify(req));
    }
  }

  #[test]
  fn test_category_display_and_prefix() {
    assert_eq!(Category::StaticAsset.to_string(), "static-asset");
    assert_eq!(Category::StaticAsset.store_prefix(), "static");
    assert_eq!(Category::Image.to_string(), "image");
  }
}
