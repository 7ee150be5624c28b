// src/scraper/homes.rs
//
// HOME'S listing-site plugin (spec §6). Unlike SUUMO's list/detail
// split, HOME'S list cards already carry a building id
// (`data-building-id`) the site assigns independently of any one
// listing — that becomes `RawListing::building_external_id`
// (SPEC_FULL §B), letting C2 skip name/address matching entirely for
// this source. Detail pages are only fetched for the fields list cards
// never carry (management fee, repair fund, agency contact).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use reqwest::blocking::Client;
use scraper::{ElementRef, Html, Selector};

use crate::db::connection::Database;
use crate::db::retry_ledger;
use crate::domain::{RawListing, SourceSite};
use crate::errors::{Error, Result};
use crate::orchestrator::task::{Phase, ResumeState};
use crate::orchestrator::{observe_safe_point, ControlFlags};
use crate::scraper::error::ScraperError;
use crate::scraper::{ScrapeFlags, Scraper};

const LIST_URL_BASE: &str = "https://www.homes.co.jp/mansion/chuko/tokyo/list";

pub struct HomesScraper {
    client: Client,
    flags: ControlFlags,
    db: Database,
    resume: Mutex<Option<ResumeState>>,
}

impl HomesScraper {
    pub fn new(client: Client, flags: ControlFlags, db: Database) -> Self {
        HomesScraper { client, flags, db, resume: Mutex::new(None) }
    }
}

fn fetch_with_retry(client: &Client, url: &str) -> std::result::Result<String, ScraperError> {
    const MAX_ATTEMPTS: u32 = 4;
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match client.get(url).send() {
            Ok(resp) if resp.status().as_u16() == 404 => {
                return Err(ScraperError::Blocked(format!("404 at {url}")));
            }
            Ok(resp) if resp.status().is_success() => {
                return resp.text().map_err(ScraperError::from);
            }
            Ok(resp) => last_err = Some(ScraperError::Network(format!("HTTP {}", resp.status()))),
            Err(e) => last_err = Some(ScraperError::from(e)),
        }
        let backoff_ms = 250u64 * attempt as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..400);
        std::thread::sleep(Duration::from_millis(backoff_ms + jitter_ms));
    }
    Err(last_err.unwrap_or_else(|| ScraperError::Network("retry loop exhausted".into())))
}

impl Scraper for HomesScraper {
    fn name(&self) -> &'static str {
        "homes"
    }

    fn source_site(&self) -> SourceSite {
        SourceSite::Homes
    }

    fn scrape_area(
        &self,
        area_code: &str,
        max_properties: i64,
        flags: ScrapeFlags,
    ) -> Result<Box<dyn Iterator<Item = Result<RawListing>> + Send>> {
        let start = self.resume.lock().expect("resume mutex poisoned").clone().unwrap_or(ResumeState {
            phase: Phase::List,
            current_page: 1,
            processed_count: 0,
            collected_count: 0,
        });

        Ok(Box::new(HomesAreaIter {
            client: self.client.clone(),
            control: self.flags.clone(),
            db: self.db.clone(),
            area_code: area_code.to_string(),
            max_properties,
            force_detail_fetch: flags.force_detail_fetch,
            resume: &self.resume,
            buffer: VecDeque::new(),
            current_page: start.current_page,
            collected: start.collected_count,
            processed: start.processed_count,
            done: false,
        }))
    }

    fn resume_state(&self) -> Option<ResumeState> {
        self.resume.lock().expect("resume mutex poisoned").clone()
    }

    fn set_resume_state(&self, state: Option<ResumeState>) {
        *self.resume.lock().expect("resume mutex poisoned") = state;
    }
}

struct ListItem {
    site_property_id: String,
    url: String,
    building_name: String,
    building_external_id: Option<String>,
    address: Option<String>,
    list_price: Option<i64>,
    layout: Option<String>,
    area_sqm: Option<f64>,
    floor: Option<i64>,
    total_floors: Option<i64>,
    built_year: Option<i64>,
}

struct HomesAreaIter<'a> {
    client: Client,
    control: ControlFlags,
    db: Database,
    area_code: String,
    max_properties: i64,
    force_detail_fetch: bool,
    resume: &'a Mutex<Option<ResumeState>>,
    buffer: VecDeque<ListItem>,
    current_page: i64,
    collected: i64,
    processed: i64,
    done: bool,
}

impl HomesAreaIter<'_> {
    fn snapshot(&self, phase: Phase) {
        *self.resume.lock().expect("resume mutex poisoned") = Some(ResumeState {
            phase,
            current_page: self.current_page,
            processed_count: self.processed,
            collected_count: self.collected,
        });
    }

    fn fetch_list_page(&self) -> std::result::Result<Vec<ListItem>, ScraperError> {
        let url = format!("{LIST_URL_BASE}/{}/?page={}", self.area_code, self.current_page);
        let html = fetch_with_retry(&self.client, &url)?;
        parse_list_page(&html)
    }

    fn needs_detail(&self, item: &ListItem) -> Result<bool> {
        self.db.with_conn(|conn| {
            if retry_ledger::should_skip_404(conn, "homes", &item.site_property_id)? {
                return Ok(false);
            }
            Ok(self.force_detail_fetch || item.list_price.is_none())
        })
    }

    fn try_next(&mut self) -> Result<Option<RawListing>> {
        if self.done || self.collected >= self.max_properties {
            return Ok(None);
        }
        if self.buffer.is_empty() {
            observe_safe_point(&self.control)?;
            match self.fetch_list_page() {
                Ok(items) if items.is_empty() => {
                    self.done = true;
                    return Ok(None);
                }
                Ok(items) => {
                    self.buffer.extend(items);
                    self.current_page += 1;
                    self.snapshot(Phase::List);
                }
                Err(ScraperError::Blocked(_)) => {
                    self.done = true;
                    return Ok(None);
                }
                Err(e) => return Err(Error::from(e)),
            }
        }

        let Some(item) = self.buffer.pop_front() else {
            self.done = true;
            return Ok(None);
        };
        self.processed += 1;

        let mut raw = RawListing {
            source_site: SourceSite::Homes,
            site_property_id: item.site_property_id.clone(),
            url: item.url.clone(),
            building_name: item.building_name.clone(),
            building_external_id: item.building_external_id.clone(),
            listing_address: item.address.clone(),
            listing_floor_number: item.floor,
            listing_area: item.area_sqm,
            listing_balcony_area: None,
            listing_layout: item.layout.clone(),
            listing_direction: None,
            listing_total_floors: item.total_floors,
            listing_basement_floors: None,
            listing_total_units: None,
            listing_built_year: item.built_year,
            listing_built_month: None,
            listing_land_rights: None,
            listing_building_structure: None,
            listing_station_info: None,
            listing_parking_info: None,
            current_price: item.list_price,
            management_fee: None,
            repair_fund: None,
            agency_name: None,
            agency_tel: None,
            first_published_at: None,
            published_at: None,
            has_update_mark: false,
            room_number: None,
        };

        if self.needs_detail(&item)? {
            observe_safe_point(&self.control)?;
            self.snapshot(Phase::Detail);
            match fetch_with_retry(&self.client, &item.url) {
                Ok(html) => match parse_detail_page(&html) {
                    Ok(detail) => {
                        if let (Some(detail_price), Some(list_price)) = (detail.price, raw.current_price) {
                            if detail_price != list_price {
                                self.db
                                    .with_conn(|conn| {
                                        retry_ledger::record_price_mismatch(conn, "homes", &item.site_property_id)
                                    })
                                    .ok();
                                return Err(Error::PriceMismatch {
                                    url: item.url.clone(),
                                    list_price,
                                    detail_price,
                                });
                            }
                        }
                        self.db
                            .with_conn(|conn| retry_ledger::resolve_price_mismatch(conn, "homes", &item.site_property_id))
                            .ok();
                        raw.current_price = raw.current_price.or(detail.price);
                        raw.management_fee = detail.management_fee;
                        raw.repair_fund = detail.repair_fund;
                        raw.agency_name = detail.agency_name;
                        raw.agency_tel = detail.agency_tel;
                        raw.listing_station_info = detail.station_info;
                        raw.room_number = detail.room_number;
                        raw.listing_land_rights = detail.land_rights;
                        raw.listing_parking_info = detail.parking;
                    }
                    Err(e) => return Err(Error::from(e)),
                },
                Err(ScraperError::Blocked(_)) => {
                    self.db
                        .with_conn(|conn| retry_ledger::record_404(conn, "homes", &item.site_property_id))
                        .ok();
                    return Err(Error::NetworkPermanent(format!("404 fetching detail for {}", item.url)));
                }
                Err(e) => return Err(Error::from(e)),
            }
        }

        self.collected += 1;
        Ok(Some(raw))
    }
}

impl Iterator for HomesAreaIter<'_> {
    type Item = Result<RawListing>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(Some(raw)) => Some(Ok(raw)),
            Ok(None) => None,
            Err(e) => {
                self.processed += 1;
                Some(Err(e))
            }
        }
    }
}

struct DetailFields {
    price: Option<i64>,
    management_fee: Option<i64>,
    repair_fund: Option<i64>,
    agency_name: Option<String>,
    agency_tel: Option<String>,
    station_info: Option<String>,
    room_number: Option<String>,
    land_rights: Option<String>,
    parking: Option<String>,
}

fn text_of(el: ElementRef) -> String {
    el.text().collect::<Vec<_>>().join("").trim().to_string()
}

/// "6,980万円" style price-in-man-yen, as used for the headline price.
fn parse_price_yen(s: &str) -> Option<i64> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok().map(|man| man * 10_000)
}

/// "15,000円" style plain-yen amount, as used for fee fields.
fn parse_plain_yen(s: &str) -> Option<i64> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn parse_list_page(html: &str) -> std::result::Result<Vec<ListItem>, ScraperError> {
    let doc = Html::parse_document(html);
    let card_sel = Selector::parse("div.moduleInner[data-building-id]").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let name_sel = Selector::parse(".bukkenName").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let link_sel = Selector::parse("a.detailLink").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let price_sel = Selector::parse(".priceLabel").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let layout_sel = Selector::parse(".layout").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let area_sel = Selector::parse(".floorSpace").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let floor_sel = Selector::parse(".floorNumber").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let total_floor_sel = Selector::parse(".totalFloors").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let built_sel = Selector::parse(".builtYear").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let addr_sel = Selector::parse(".address").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;

    let mut out = Vec::new();
    for card in doc.select(&card_sel) {
        let building_external_id = card.value().attr("data-building-id").map(str::to_string);
        let Some(link) = card.select(&link_sel).next() else { continue };
        let Some(href) = link.value().attr("href") else { continue };
        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("https://www.homes.co.jp{href}")
        };
        let site_property_id = url
            .rsplit('/')
            .find(|seg| !seg.is_empty())
            .unwrap_or(&url)
            .to_string();
        let building_name = card.select(&name_sel).next().map(text_of).unwrap_or_default();
        if building_name.is_empty() {
            continue;
        }
        let list_price = card.select(&price_sel).next().map(text_of).and_then(|s| parse_price_yen(&s));
        let layout = card.select(&layout_sel).next().map(text_of).filter(|s| !s.is_empty());
        let area_sqm = card
            .select(&area_sel)
            .next()
            .map(text_of)
            .and_then(|s| s.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect::<String>().parse().ok());
        let floor = card
            .select(&floor_sel)
            .next()
            .map(text_of)
            .and_then(|s| s.chars().filter(|c| c.is_ascii_digit()).collect::<String>().parse().ok());
        let total_floors = card
            .select(&total_floor_sel)
            .next()
            .map(text_of)
            .and_then(|s| s.chars().filter(|c| c.is_ascii_digit()).collect::<String>().parse().ok());
        let built_year = card
            .select(&built_sel)
            .next()
            .map(text_of)
            .and_then(|s| s.chars().filter(|c| c.is_ascii_digit()).take(4).collect::<String>().parse().ok());
        let address = card.select(&addr_sel).next().map(text_of).filter(|s| !s.is_empty());

        out.push(ListItem {
            site_property_id,
            url,
            building_name,
            building_external_id,
            address,
            list_price,
            layout,
            area_sqm,
            floor,
            total_floors,
            built_year,
        });
    }
    Ok(out)
}

fn parse_detail_page(html: &str) -> std::result::Result<DetailFields, ScraperError> {
    let doc = Html::parse_document(html);
    let row_sel = Selector::parse("dl.detailTable > div").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let dt_sel = Selector::parse("dt").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;
    let dd_sel = Selector::parse("dd").map_err(|e| ScraperError::HtmlParse(e.to_string()))?;

    let mut fields = DetailFields {
        price: None,
        management_fee: None,
        repair_fund: None,
        agency_name: None,
        agency_tel: None,
        station_info: None,
        room_number: None,
        land_rights: None,
        parking: None,
    };

    for row in doc.select(&row_sel) {
        let Some(label) = row.select(&dt_sel).next().map(text_of) else { continue };
        let Some(value) = row.select(&dd_sel).next().map(text_of) else { continue };
        match label.as_str() {
            "価格" => fields.price = parse_price_yen(&value),
            "管理費" => fields.management_fee = parse_plain_yen(&value),
            "修繕積立金" => fields.repair_fund = parse_plain_yen(&value),
            "交通" => fields.station_info = Some(value),
            "部屋番号" => fields.room_number = Some(value),
            "土地権利" => fields.land_rights = Some(value),
            "駐車場" => fields.parking = Some(value),
            "取引態様" | "会社名" => fields.agency_name = Some(value),
            "TEL" => fields.agency_tel = Some(value),
            _ => {}
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_page_carries_building_external_id() {
        let html = r#"
            <html><body>
            <div class="moduleInner" data-building-id="B00912345">
                <div class="bukkenName">グランドメゾン青山</div>
                <span class="priceLabel">6,980万円</span>
                <span class="layout">3LDK</span>
                <span class="floorSpace">72.30m2</span>
                <span class="floorNumber">7階</span>
                <span class="totalFloors">地上12階</span>
                <span class="builtYear">2009年築</span>
                <span class="address">東京都港区北青山</span>
                <a class="detailLink" href="/mansion/b-912345/">link</a>
            </div>
            </body></html>
        "#;
        let items = parse_list_page(html).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].building_external_id.as_deref(), Some("B00912345"));
        assert_eq!(items[0].list_price, Some(69_800_000));
        assert_eq!(items[0].built_year, Some(2009));
    }

    #[test]
    fn parse_detail_page_reads_fee_rows() {
        let html = r#"
            <html><body><dl class="detailTable">
                <div><dt>管理費</dt><dd>15,000円</dd></div>
                <div><dt>修繕積立金</dt><dd>8,000円</dd></div>
            </dl></body></html>
        "#;
        let d = parse_detail_page(html).unwrap();
        assert_eq!(d.management_fee, Some(15_000));
        assert_eq!(d.repair_fund, Some(8_000));
    }
}
