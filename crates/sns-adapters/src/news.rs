//! Decoding of the `NewListInformation` XML envelope.

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use sns_core::Article;

use crate::FeedError;

const ROOT: &str = "NewListInformation";
const ITEM: &str = "NewsletterNewsItem";

pub const STATUS_PUBLISHED: &str = "published";
pub const STATUS_UNPUBLISHED: &str = "unpublished";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewsList {
    pub club_name: Option<String>,
    pub club_website_url: Option<String>,
    pub items: Vec<NewsItem>,
}

impl NewsList {
    pub fn into_articles(self) -> Vec<Article> {
        self.items.into_iter().map(NewsItem::into_article).collect()
    }
}

/// One `NewsletterNewsItem` exactly as the feed carries it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewsItem {
    pub article_id: String,
    pub article_url: String,
    pub publish_date: String,
    pub title: String,
    pub opta_match_id: Option<String>,
    pub teaser_text: Option<String>,
    pub thumbnail_image_url: Option<String>,
    pub taxonomies: Option<String>,
    pub last_update_date: Option<String>,
    pub is_published: Option<String>,
}

impl NewsItem {
    /// Map into the ingestion model. The publish date is carried verbatim and only checked by the upsert path.
    pub fn into_article(self) -> Article {
        let kind = self
            .taxonomies
            .as_deref()
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let status = match self.is_published.as_deref() {
            Some(flag) if flag.eq_ignore_ascii_case("false") => STATUS_UNPUBLISHED,
            _ => STATUS_PUBLISHED,
        };

        Article {
            business_id: self.article_id,
            team_id: String::new(),
            opta_match_id: self.opta_match_id,
            title: self.title,
            kind,
            teaser: self.teaser_text,
            content: String::new(),
            url: self.article_url,
            image_url: self.thumbnail_image_url.unwrap_or_default(),
            gallery_urls: None,
            video_url: None,
            published: self.publish_date,
            status: status.to_string(),
        }
    }

    fn set_field(&mut self, element: &str, text: String) {
        match element {
            "NewsArticleID" => self.article_id = text,
            "ArticleURL" => self.article_url = text,
            "PublishDate" => self.publish_date = text,
            "Title" => self.title = text,
            "OptaMatchId" => self.opta_match_id = Some(text),
            "TeaserText" => self.teaser_text = Some(text),
            "ThumbnailImageURL" => self.thumbnail_image_url = Some(text),
            "Taxonomies" => self.taxonomies = Some(text),
            "LastUpdateDate" => self.last_update_date = Some(text),
            "IsPublished" => self.is_published = Some(text),
            _ => {}
        }
    }
}

/// Parse the whole document. Any XML error, or a root other than `NewListInformation`, fails the feed.
pub fn parse_news_list(xml: &[u8]) -> Result<NewsList, FeedError> {
    let mut reader = Reader::from_reader(xml);

    let mut list = NewsList::default();
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut current_item: Option<NewsItem> = None;
    // Raw text of the innermost open element; text and CDATA chunks are joined before trimming.
    let mut text = String::new();
    let mut saw_root = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| FeedError::Decode(format!("XML parse error: {e}")))?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if path.is_empty() {
                    check_root(&name, saw_root)?;
                    saw_root = true;
                }
                if name == ITEM {
                    current_item = Some(NewsItem::default());
                }
                text.clear();
                path.push(name);
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if path.is_empty() {
                    check_root(&name, saw_root)?;
                    saw_root = true;
                } else if name == ITEM {
                    list.items.push(NewsItem::default());
                }
                text.clear();
            }
            Event::End(_) => {
                assign_text(&path, &mut current_item, &mut list, text.trim());
                text.clear();
                if let Some(name) = path.pop() {
                    if name == ITEM {
                        if let Some(item) = current_item.take() {
                            list.items.push(item);
                        }
                    }
                }
            }
            Event::Text(e) => {
                let chunk = e
                    .unescape()
                    .map_err(|e| FeedError::Decode(format!("XML text error: {e}")))?;
                text.push_str(&chunk);
            }
            Event::CData(e) => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(FeedError::Decode(format!("document has no <{ROOT}> element")));
    }
    if !path.is_empty() {
        return Err(FeedError::Decode(format!(
            "document ended inside <{}>",
            path.join("/")
        )));
    }
    Ok(list)
}

fn check_root(name: &str, saw_root: bool) -> Result<(), FeedError> {
    if saw_root || name != ROOT {
        return Err(FeedError::Decode(format!(
            "unexpected root element <{name}>, expected <{ROOT}>"
        )));
    }
    Ok(())
}

fn assign_text(path: &[String], item: &mut Option<NewsItem>, list: &mut NewsList, text: &str) {
    if text.is_empty() {
        return;
    }
    let Some(element) = path.last() else {
        return;
    };
    if let Some(item) = item.as_mut() {
        if path.len() >= 2 && path[path.len() - 2] == ITEM {
            item.set_field(element, text.to_string());
        }
        return;
    }
    if path.len() == 2 {
        match element.as_str() {
            "ClubName" => list.club_name = Some(text.to_string()),
            "ClubWebsiteURL" => list.club_website_url = Some(text.to_string()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_ITEMS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<NewListInformation>
  <ClubName>Brentford</ClubName>
  <ClubWebsiteURL>https://www.brentfordfc.com</ClubWebsiteURL>
  <NewsletterNewsItems>
    <NewsletterNewsItem>
      <ArticleURL>https://www.brentfordfc.com/news/2022/july/technology-support-technician/</ArticleURL>
      <NewsArticleID>645168</NewsArticleID>
      <PublishDate>2022-07-04 13:00:00</PublishDate>
      <Taxonomies>Club News, Jobs</Taxonomies>
      <TeaserText><![CDATA[Join the <b>IT</b> team]]></TeaserText>
      <ThumbnailImageURL>https://cdn.example.com/645168.jpg</ThumbnailImageURL>
      <Title>Brentford FC advertise for Technology Support Technician</Title>
      <OptaMatchId/>
      <LastUpdateDate>2022-07-04 13:05:00</LastUpdateDate>
      <IsPublished>True</IsPublished>
    </NewsletterNewsItem>
    <NewsletterNewsItem>
      <ArticleURL>https://www.brentfordfc.com/news/2022/july/worldnet-2022/</ArticleURL>
      <NewsArticleID>645150</NewsArticleID>
      <PublishDate>2022-07-04 11:00:00</PublishDate>
      <Title>Club supports fans heading to tournament &amp; beyond</Title>
      <OptaMatchId>g2210324</OptaMatchId>
      <IsPublished>False</IsPublished>
    </NewsletterNewsItem>
  </NewsletterNewsItems>
</NewListInformation>"#;

    #[test]
    fn parses_items_in_document_order() {
        let list = parse_news_list(TWO_ITEMS.as_bytes()).unwrap();
        assert_eq!(list.club_name.as_deref(), Some("Brentford"));
        assert_eq!(list.items.len(), 2);

        let first = &list.items[0];
        assert_eq!(first.article_id, "645168");
        assert_eq!(first.publish_date, "2022-07-04 13:00:00");
        assert_eq!(first.teaser_text.as_deref(), Some("Join the <b>IT</b> team"));
        assert_eq!(first.opta_match_id, None);

        let second = &list.items[1];
        assert_eq!(second.title, "Club supports fans heading to tournament & beyond");
        assert_eq!(second.opta_match_id.as_deref(), Some("g2210324"));
    }

    #[test]
    fn maps_items_into_articles() {
        let articles = parse_news_list(TWO_ITEMS.as_bytes()).unwrap().into_articles();
        let first = &articles[0];
        assert_eq!(first.business_id, "645168");
        assert_eq!(first.kind, vec!["Club News".to_string(), "Jobs".to_string()]);
        assert_eq!(first.image_url, "https://cdn.example.com/645168.jpg");
        assert_eq!(first.status, STATUS_PUBLISHED);
        assert_eq!(first.gallery_urls, None);
        assert_eq!(first.video_url, None);
        assert_eq!(articles[1].status, STATUS_UNPUBLISHED);
        assert!(articles[1].kind.is_empty());
    }

    #[test]
    fn unparsable_dates_pass_through_unchanged() {
        let xml = r#"<NewListInformation><NewsletterNewsItems>
            <NewsletterNewsItem><NewsArticleID>1</NewsArticleID><PublishDate>yesterday</PublishDate></NewsletterNewsItem>
        </NewsletterNewsItems></NewListInformation>"#;
        let articles = parse_news_list(xml.as_bytes()).unwrap().into_articles();
        assert_eq!(articles[0].published, "yesterday");
    }

    #[test]
    fn mixed_text_and_cdata_keep_inner_whitespace() {
        let xml = r#"<NewListInformation><NewsletterNewsItems>
            <NewsletterNewsItem>
              <NewsArticleID> 7 </NewsArticleID>
              <Title>Bees <![CDATA[B team]]> win</Title>
              <TeaserText>
                <![CDATA[Late <b>winner</b>]]> at Griffin Park
              </TeaserText>
            </NewsletterNewsItem>
        </NewsletterNewsItems></NewListInformation>"#;
        let list = parse_news_list(xml.as_bytes()).unwrap();
        let item = &list.items[0];
        assert_eq!(item.article_id, "7");
        assert_eq!(item.title, "Bees B team win");
        assert_eq!(item.teaser_text.as_deref(), Some("Late <b>winner</b> at Griffin Park"));
    }

    #[test]
    fn empty_item_list_is_not_an_error() {
        let xml = "<NewListInformation><ClubName>Brentford</ClubName><NewsletterNewsItems/></NewListInformation>";
        let list = parse_news_list(xml.as_bytes()).unwrap();
        assert!(list.items.is_empty());
    }

    #[test]
    fn wrong_root_is_a_decode_error() {
        let xml = "<rss><channel><item><title>x</title></item></channel></rss>";
        assert!(matches!(
            parse_news_list(xml.as_bytes()),
            Err(FeedError::Decode(_))
        ));
    }

    #[test]
    fn truncated_or_empty_documents_fail_the_whole_feed() {
        let truncated = &TWO_ITEMS[..TWO_ITEMS.len() / 2];
        assert!(parse_news_list(truncated.as_bytes()).is_err());
        assert!(parse_news_list(b"").is_err());
        assert!(parse_news_list(b"<html><body>Service Unavailable</body></html>").is_err());
    }
}
