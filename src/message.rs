//! Callback messages and passive replies

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeResult;

// =============================================================================
// Inbound messages
// =============================================================================

/// Message type, derived from the raw `MsgType` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgType {
    Text,
    Image,
    Voice,
    Video,
    ShortVideo,
    Location,
    Link,
    Event,
    Other(String),
}

impl MsgType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "text" => Self::Text,
            "image" => Self::Image,
            "voice" => Self::Voice,
            "video" => Self::Video,
            "shortvideo" => Self::ShortVideo,
            "location" => Self::Location,
            "link" => Self::Link,
            "event" => Self::Event,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Scan event payload (`scancode_push`, `scancode_waitmsg`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScanCodeInfo {
    #[serde(rename = "ScanType", default)]
    pub scan_type: Option<String>,
    #[serde(rename = "ScanResult", default)]
    pub scan_result: Option<String>,
}

/// Photo picker event payload (`pic_sysphoto`, `pic_photo_or_album`, `pic_weixin`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SendPicsInfo {
    #[serde(rename = "Count", default)]
    pub count: Option<u32>,
    #[serde(rename = "PicList", default)]
    pub pic_list: Option<PicList>,
}

impl SendPicsInfo {
    /// MD5 sums of the sent pictures, in order
    pub fn pic_md5_sums(&self) -> Vec<&str> {
        self.pic_list
            .iter()
            .flat_map(|list| list.items.iter())
            .filter_map(|item| item.pic_md5_sum.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PicList {
    #[serde(rename = "item", default)]
    pub items: Vec<PicItem>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PicItem {
    #[serde(rename = "PicMd5Sum", default)]
    pub pic_md5_sum: Option<String>,
}

/// Location picker event payload (`location_select`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SendLocationInfo {
    #[serde(rename = "Location_X", default)]
    pub location_x: Option<String>,
    #[serde(rename = "Location_Y", default)]
    pub location_y: Option<String>,
    #[serde(rename = "Scale", default)]
    pub scale: Option<String>,
    #[serde(rename = "Label", default)]
    pub label: Option<String>,
    #[serde(rename = "Poiname", default)]
    pub poiname: Option<String>,
}

/// Incoming message or event from the Official Account platform
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "xml")]
pub struct Message {
    #[serde(rename = "ToUserName")]
    pub to_user_name: String,
    #[serde(rename = "FromUserName")]
    pub from_user_name: String,
    #[serde(rename = "CreateTime")]
    pub create_time: i64,
    #[serde(rename = "MsgType")]
    pub msg_type: String,
    #[serde(rename = "MsgId", default)]
    pub msg_id: Option<i64>,
    #[serde(rename = "Content", default)]
    pub content: Option<String>,
    #[serde(rename = "PicUrl", default)]
    pub pic_url: Option<String>,
    #[serde(rename = "MediaId", default)]
    pub media_id: Option<String>,
    #[serde(rename = "Format", default)]
    pub format: Option<String>,
    #[serde(rename = "Recognition", default)]
    pub recognition: Option<String>,
    #[serde(rename = "ThumbMediaId", default)]
    pub thumb_media_id: Option<String>,
    #[serde(rename = "Location_X", default)]
    pub location_x: Option<f64>,
    #[serde(rename = "Location_Y", default)]
    pub location_y: Option<f64>,
    #[serde(rename = "Scale", default)]
    pub scale: Option<u32>,
    #[serde(rename = "Label", default)]
    pub label: Option<String>,
    #[serde(rename = "Title", default)]
    pub title: Option<String>,
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
    #[serde(rename = "Url", default)]
    pub url: Option<String>,
    #[serde(rename = "Event", default)]
    pub event: Option<String>,
    #[serde(rename = "EventKey", default)]
    pub event_key: Option<String>,
    #[serde(rename = "Ticket", default)]
    pub ticket: Option<String>,
    #[serde(rename = "Latitude", default)]
    pub latitude: Option<f64>,
    #[serde(rename = "Longitude", default)]
    pub longitude: Option<f64>,
    #[serde(rename = "Precision", default)]
    pub precision: Option<f64>,
    #[serde(rename = "MenuId", default)]
    pub menu_id: Option<String>,
    #[serde(rename = "ScanCodeInfo", default)]
    pub scan_code_info: Option<ScanCodeInfo>,
    #[serde(rename = "SendPicsInfo", default)]
    pub send_pics_info: Option<SendPicsInfo>,
    #[serde(rename = "SendLocationInfo", default)]
    pub send_location_info: Option<SendLocationInfo>,
}

impl Message {
    pub fn from_xml(xml: &str) -> EnvelopeResult<Self> {
        Ok(serde_xml_rs::from_str(xml)?)
    }

    pub fn kind(&self) -> MsgType {
        MsgType::parse(&self.msg_type)
    }

    /// Render `reply` addressed back to the sender of this message
    pub fn reply(&self, reply: &Reply) -> String {
        reply.to_xml(
            &self.from_user_name,
            &self.to_user_name,
            Utc::now().timestamp(),
        )
    }
}

// =============================================================================
// Passive replies
// =============================================================================

/// Media reference for image/voice/video replies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Media {
    pub media_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl Media {
    pub fn new(media_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            ..Default::default()
        }
    }
}

/// Music reply body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Music {
    pub title: Option<String>,
    pub description: Option<String>,
    pub music_url: Option<String>,
    pub hq_music_url: Option<String>,
    pub thumb_media_id: String,
}

/// One item of a news reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Article {
    pub title: String,
    pub description: String,
    pub pic_url: String,
    pub url: String,
}

impl Article {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        pic_url: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            pic_url: pic_url.into(),
            url: url.into(),
        }
    }
}

/// Passive reply returned in the callback response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Image(Media),
    Voice(Media),
    Video(Media),
    Music(Music),
    News(Vec<Article>),
}

impl Reply {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Voice(_) => "voice",
            Self::Video(_) => "video",
            Self::Music(_) => "music",
            Self::News(_) => "news",
        }
    }

    /// Render the reply XML
    pub fn to_xml(&self, to_user: &str, from_user: &str, create_time: i64) -> String {
        let mut out = String::with_capacity(256);
        out.push_str("<xml>");
        push_cdata(&mut out, "ToUserName", to_user);
        push_cdata(&mut out, "FromUserName", from_user);
        push_plain(&mut out, "CreateTime", &create_time.to_string());
        push_cdata(&mut out, "MsgType", self.msg_type());

        match self {
            Self::Text(content) => push_cdata(&mut out, "Content", content),
            Self::Image(media) => push_media(&mut out, "Image", media, false),
            Self::Voice(media) => push_media(&mut out, "Voice", media, false),
            Self::Video(media) => push_media(&mut out, "Video", media, true),
            Self::Music(music) => {
                out.push_str("<Music>");
                push_opt_cdata(&mut out, "Title", music.title.as_deref());
                push_opt_cdata(&mut out, "Description", music.description.as_deref());
                push_opt_cdata(&mut out, "MusicUrl", music.music_url.as_deref());
                push_opt_cdata(&mut out, "HQMusicUrl", music.hq_music_url.as_deref());
                push_cdata(&mut out, "ThumbMediaId", &music.thumb_media_id);
                out.push_str("</Music>");
            }
            Self::News(articles) => {
                push_plain(&mut out, "ArticleCount", &articles.len().to_string());
                out.push_str("<Articles>");
                for article in articles {
                    out.push_str("<item>");
                    push_cdata(&mut out, "Title", &article.title);
                    push_cdata(&mut out, "Description", &article.description);
                    push_cdata(&mut out, "PicUrl", &article.pic_url);
                    push_cdata(&mut out, "Url", &article.url);
                    out.push_str("</item>");
                }
                out.push_str("</Articles>");
            }
        }

        out.push_str("</xml>");
        out
    }
}

fn push_media(out: &mut String, tag: &str, media: &Media, with_text: bool) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    push_cdata(out, "MediaId", &media.media_id);
    if with_text {
        push_opt_cdata(out, "Title", media.title.as_deref());
        push_opt_cdata(out, "Description", media.description.as_deref());
    }
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

/// Append `<tag><![CDATA[value]]></tag>`
///
/// A literal `]]>` in `value` is split across two CDATA sections.
pub(crate) fn push_cdata(out: &mut String, tag: &str, value: &str) {
    out.push('<');
    out.push_str(tag);
    out.push_str("><![CDATA[");
    out.push_str(&value.replace("]]>", "]]]]><![CDATA[>"));
    out.push_str("]]></");
    out.push_str(tag);
    out.push('>');
}

fn push_opt_cdata(out: &mut String, tag: &str, value: Option<&str>) {
    if let Some(value) = value {
        push_cdata(out, tag, value);
    }
}

fn push_plain(out: &mut String, tag: &str, value: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(value);
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message_parsing() {
        let xml = r#"<xml><ToUserName><![CDATA[gh_10f6c3c3ac5a]]></ToUserName>
<FromUserName><![CDATA[oyORnuP8q7ou2gfYjqLzSIWZf0rs]]></FromUserName>
<CreateTime>1409735668</CreateTime>
<MsgType><![CDATA[text]]></MsgType>
<Content><![CDATA[abcdteT]]></Content>
<MsgId>6054768590064713728</MsgId>
</xml>"#;

        let msg = Message::from_xml(xml).unwrap();
        assert_eq!(msg.to_user_name, "gh_10f6c3c3ac5a");
        assert_eq!(msg.from_user_name, "oyORnuP8q7ou2gfYjqLzSIWZf0rs");
        assert_eq!(msg.create_time, 1409735668);
        assert_eq!(msg.kind(), MsgType::Text);
        assert_eq!(msg.content.as_deref(), Some("abcdteT"));
        assert_eq!(msg.msg_id, Some(6054768590064713728));
        assert!(msg.event.is_none());
    }

    #[test]
    fn test_event_parsing() {
        let xml = r#"<xml>
  <ToUserName><![CDATA[toUser]]></ToUserName>
  <FromUserName><![CDATA[fromUser]]></FromUserName>
  <CreateTime>1515467979</CreateTime>
  <MsgType><![CDATA[event]]></MsgType>
  <Event><![CDATA[scancode_push]]></Event>
  <EventKey><![CDATA[eventKey]]></EventKey>
  <ScanCodeInfo>
    <ScanType><![CDATA[qrcode]]></ScanType>
    <ScanResult><![CDATA[1]]></ScanResult>
  </ScanCodeInfo>
</xml>"#;

        let msg = Message::from_xml(xml).unwrap();
        assert_eq!(msg.kind(), MsgType::Event);
        assert_eq!(msg.event.as_deref(), Some("scancode_push"));
        assert_eq!(msg.event_key.as_deref(), Some("eventKey"));
        let scan = msg.scan_code_info.unwrap();
        assert_eq!(scan.scan_type.as_deref(), Some("qrcode"));
        assert_eq!(scan.scan_result.as_deref(), Some("1"));
    }

    #[test]
    fn test_pic_event_parsing() {
        let xml = r#"<xml>
  <ToUserName><![CDATA[gh_e136c6e50636]]></ToUserName>
  <FromUserName><![CDATA[oMgHVjngRipVsoxg6TuX3vz6glDg]]></FromUserName>
  <CreateTime>1408090651</CreateTime>
  <MsgType><![CDATA[event]]></MsgType>
  <Event><![CDATA[pic_sysphoto]]></Event>
  <EventKey><![CDATA[6]]></EventKey>
  <SendPicsInfo>
    <Count>2</Count>
    <PicList>
      <item><PicMd5Sum><![CDATA[1b5f7c23b5bf75682a53e7b6d163e185]]></PicMd5Sum></item>
      <item><PicMd5Sum><![CDATA[9ee2ffc4d0a4e4c2b0d1b8e4c4cb2b27]]></PicMd5Sum></item>
    </PicList>
  </SendPicsInfo>
</xml>"#;

        let msg = Message::from_xml(xml).unwrap();
        assert_eq!(msg.event.as_deref(), Some("pic_sysphoto"));

        let pics = msg.send_pics_info.unwrap();
        assert_eq!(pics.count, Some(2));
        assert_eq!(
            pics.pic_md5_sums(),
            vec![
                "1b5f7c23b5bf75682a53e7b6d163e185",
                "9ee2ffc4d0a4e4c2b0d1b8e4c4cb2b27"
            ]
        );
    }

    #[test]
    fn test_location_parsing() {
        let xml = r#"<xml>
  <ToUserName><![CDATA[toUser]]></ToUserName>
  <FromUserName><![CDATA[fromUser]]></FromUserName>
  <CreateTime>1351776360</CreateTime>
  <MsgType><![CDATA[location]]></MsgType>
  <Location_X>23.134521</Location_X>
  <Location_Y>113.358803</Location_Y>
  <Scale>20</Scale>
  <Label><![CDATA[Somewhere]]></Label>
  <MsgId>1234567890123456</MsgId>
</xml>"#;

        let msg = Message::from_xml(xml).unwrap();
        assert_eq!(msg.kind(), MsgType::Location);
        assert_eq!(msg.location_x, Some(23.134521));
        assert_eq!(msg.scale, Some(20));
        assert_eq!(msg.label.as_deref(), Some("Somewhere"));
    }

    #[test]
    fn test_msg_type_parse() {
        assert_eq!(MsgType::parse("shortvideo"), MsgType::ShortVideo);
        assert_eq!(MsgType::parse("link"), MsgType::Link);
        assert_eq!(
            MsgType::parse("miniprogrampage"),
            MsgType::Other("miniprogrampage".to_string())
        );
    }

    #[test]
    fn test_text_reply_xml() {
        let xml = Reply::text("Hello").to_xml("openid", "gh_abc", 1515926128);
        assert_eq!(
            xml,
            "<xml><ToUserName><![CDATA[openid]]></ToUserName>\
             <FromUserName><![CDATA[gh_abc]]></FromUserName>\
             <CreateTime>1515926128</CreateTime>\
             <MsgType><![CDATA[text]]></MsgType>\
             <Content><![CDATA[Hello]]></Content></xml>"
        );

        // Reply renders as a message the platform (and we) can parse
        let parsed = Message::from_xml(&xml).unwrap();
        assert_eq!(parsed.to_user_name, "openid");
        assert_eq!(parsed.content.as_deref(), Some("Hello"));
    }

    #[test]
    fn test_media_replies() {
        let image = Reply::Image(Media::new("media-1")).to_xml("u", "g", 1);
        assert!(image.contains("<Image><MediaId><![CDATA[media-1]]></MediaId></Image>"));

        let video = Reply::Video(Media {
            media_id: "media-2".to_string(),
            title: Some("Clip".to_string()),
            description: None,
        })
        .to_xml("u", "g", 1);
        assert!(video.contains("<MsgType><![CDATA[video]]></MsgType>"));
        assert!(video.contains(
            "<Video><MediaId><![CDATA[media-2]]></MediaId><Title><![CDATA[Clip]]></Title></Video>"
        ));

        let music = Reply::Music(Music {
            title: Some("Song".to_string()),
            thumb_media_id: "thumb".to_string(),
            ..Default::default()
        })
        .to_xml("u", "g", 1);
        assert!(music.contains("<Music><Title><![CDATA[Song]]></Title>"));
        assert!(music.contains("<ThumbMediaId><![CDATA[thumb]]></ThumbMediaId></Music>"));
    }

    #[test]
    fn test_news_reply() {
        let reply = Reply::News(vec![
            Article::new("One", "First", "http://a/1.png", "http://a/1"),
            Article::new("Two", "Second", "http://a/2.png", "http://a/2"),
        ]);
        let xml = reply.to_xml("u", "g", 1);

        assert!(xml.contains("<MsgType><![CDATA[news]]></MsgType>"));
        assert!(xml.contains("<ArticleCount>2</ArticleCount>"));
        assert_eq!(xml.matches("<item>").count(), 2);
        assert!(xml.contains("<Url><![CDATA[http://a/2]]></Url></item></Articles>"));
    }

    #[test]
    fn test_cdata_terminator_is_split() {
        let mut out = String::new();
        push_cdata(&mut out, "Content", "a]]>b");
        assert_eq!(out, "<Content><![CDATA[a]]]]><![CDATA[>b]]></Content>");
    }

    #[test]
    fn test_message_reply_swaps_users() {
        let msg = Message::from_xml(
            "<xml><ToUserName>gh_abc</ToUserName><FromUserName>openid</FromUserName>\
             <CreateTime>1</CreateTime><MsgType>text</MsgType><Content>hi</Content></xml>",
        )
        .unwrap();

        let xml = msg.reply(&Reply::text("hi"));
        assert!(xml.starts_with(
            "<xml><ToUserName><![CDATA[openid]]></ToUserName><FromUserName><![CDATA[gh_abc]]></FromUserName>"
        ));
    }
}
