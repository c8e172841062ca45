use crate::error::UpdaterError;
use crate::platform::build_number::{BuildNumber, BuildRange};
use crate::plugins::installed::PluginId;
use crate::plugins::repository::{RemotePlugin, RepositoryHost};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use reqwest::Url;

#[derive(Debug, Default)]
struct Entry {
    id: Option<String>,
    name: Option<String>,
    version: Option<String>,
    url: Option<String>,
    since: Option<String>,
    until: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Id,
    Name,
    Version,
    DownloadUrl,
}

/// Parse the plugin listing of a custom repository.
///
/// Both the short form (`<plugins><plugin id=".." url=".." version="..">`)
/// and the long form (`<plugin-repository>` with nested `<idea-plugin>`
/// elements) are understood. Relative download URLs are resolved against
/// `host`. Entries without id or version are skipped.
pub fn parse_plugin_list(xml: &str, host: &Url) -> Result<Vec<RemotePlugin>, UpdaterError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut plugins = Vec::new();
    let mut entry: Option<Entry> = None;
    let mut field = None;

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                field = open(&element, &mut entry)?;
            }
            Event::Empty(element) => {
                open(&element, &mut entry)?;
                if is_plugin_element(element.name().as_ref()) {
                    finish(entry.take(), host, &mut plugins);
                }
            }
            Event::End(element) => {
                field = None;
                if is_plugin_element(element.name().as_ref()) {
                    finish(entry.take(), host, &mut plugins);
                }
            }
            Event::Text(text) => {
                if let (Some(field), Some(entry)) = (field, entry.as_mut()) {
                    let text = text.unescape()?.into_owned();
                    match field {
                        Field::Id => entry.id = Some(text),
                        Field::Name => entry.name = Some(text),
                        Field::Version => entry.version = Some(text),
                        Field::DownloadUrl => entry.url = Some(text),
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(plugins)
}

fn is_plugin_element(name: &[u8]) -> bool {
    matches!(name, b"plugin" | b"idea-plugin")
}

fn open(element: &BytesStart, entry: &mut Option<Entry>) -> Result<Option<Field>, UpdaterError> {
    let name = element.name();

    if is_plugin_element(name.as_ref()) {
        let mut new_entry = Entry::default();
        for attr in element.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let value = attr.unescape_value()?.into_owned();
            match attr.key.as_ref() {
                b"id" => new_entry.id = Some(value),
                b"url" => new_entry.url = Some(value),
                b"version" => new_entry.version = Some(value),
                _ => {}
            }
        }
        *entry = Some(new_entry);
        return Ok(None);
    }

    let Some(entry) = entry.as_mut() else {
        return Ok(None);
    };

    Ok(match name.as_ref() {
        b"id" => Some(Field::Id),
        b"name" => Some(Field::Name),
        b"version" => Some(Field::Version),
        b"download-url" => Some(Field::DownloadUrl),
        b"idea-version" => {
            for attr in element.attributes() {
                let attr = attr.map_err(quick_xml::Error::from)?;
                let value = attr.unescape_value()?.into_owned();
                match attr.key.as_ref() {
                    b"since-build" => entry.since = Some(value),
                    b"until-build" => entry.until = Some(value),
                    _ => {}
                }
            }
            None
        }
        _ => None,
    })
}

fn finish(entry: Option<Entry>, host: &Url, plugins: &mut Vec<RemotePlugin>) {
    let Some(entry) = entry else {
        return;
    };

    let (Some(id), Some(version)) = (entry.id, entry.version) else {
        tracing::debug!("Skipping plugin entry without id or version in {}", host);
        return;
    };

    let download_url = entry.url.as_deref().and_then(|url| match host.join(url) {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::warn!("Invalid download url {:?} for {} in {}: {}", url, id, host, err);
            None
        }
    });

    plugins.push(RemotePlugin {
        name: entry.name.unwrap_or_else(|| id.clone()),
        id: PluginId::new(id),
        version,
        compatibility: BuildRange::new(
            parse_bound(entry.since.as_deref()),
            parse_bound(entry.until.as_deref()),
        ),
        download_url,
        host: RepositoryHost::Custom(host.clone()),
    });
}

pub(super) fn parse_bound(value: Option<&str>) -> Option<BuildNumber> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }

    match BuildNumber::parse(value) {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::debug!("Ignoring compatibility bound {:?}: {}", value, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Url {
        Url::parse("https://repo.example.com/plugins/updatePlugins.xml").unwrap()
    }

    #[test]
    fn parses_short_form() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<plugins>
  <plugin id="com.example.one" url="one-1.2.zip" version="1.2">
    <idea-version since-build="241" until-build="242.*"/>
    <name>Example One</name>
  </plugin>
  <plugin id="com.example.two" url="https://cdn.example.com/two.zip" version="0.9"/>
  <plugin url="broken.zip" version="1.0"/>
</plugins>"#;

        let plugins = parse_plugin_list(xml, &host()).unwrap();
        assert_eq!(plugins.len(), 2);

        let one = &plugins[0];
        assert_eq!(one.id.as_str(), "com.example.one");
        assert_eq!(one.name, "Example One");
        assert_eq!(one.version, "1.2");
        assert_eq!(
            one.download_url.as_ref().unwrap().as_str(),
            "https://repo.example.com/plugins/one-1.2.zip"
        );
        assert!(one.is_compatible_with(&"241.5".parse().unwrap()));
        assert!(!one.is_compatible_with(&"243.1".parse().unwrap()));
        assert_eq!(one.host, RepositoryHost::Custom(host()));

        let two = &plugins[1];
        assert_eq!(two.name, "com.example.two");
        assert_eq!(two.download_url.as_ref().unwrap().as_str(), "https://cdn.example.com/two.zip");
        assert_eq!(two.compatibility, BuildRange::default());
    }

    #[test]
    fn parses_long_form() {
        let xml = r#"<plugin-repository>
  <category name="Tools">
    <idea-plugin downloads="10" size="100">
      <name>Long Form</name>
      <id>com.example.long</id>
      <version>3.1.4</version>
      <idea-version min="n/a" max="n/a" since-build="233.1"/>
      <download-url>files/long.zip</download-url>
    </idea-plugin>
  </category>
</plugin-repository>"#;

        let plugins = parse_plugin_list(xml, &host()).unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].id.as_str(), "com.example.long");
        assert_eq!(plugins[0].version, "3.1.4");
        assert_eq!(
            plugins[0].download_url.as_ref().unwrap().as_str(),
            "https://repo.example.com/plugins/files/long.zip"
        );
        assert!(plugins[0].is_compatible_with(&"241.1".parse().unwrap()));
        assert!(!plugins[0].is_compatible_with(&"232.1".parse().unwrap()));
    }
}
