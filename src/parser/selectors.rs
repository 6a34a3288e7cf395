//! CSS selectors for catalog markup.
//!
//! The catalog's markup changes without notice; when a field stops parsing,
//! capture a page, update the selector here and add a fixture.

use std::sync::LazyLock;

use scraper::Selector;

fn sel(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

/// Search/listing pages.
pub mod listing {
    use super::*;

    pub static RESULT: LazyLock<Selector> = LazyLock::new(|| sel("div.s-result-item"));

    pub const ID_ATTR: &str = "data-asin";
    pub const COMPONENT_ATTR: &str = "data-component-type";

    pub static TITLE: LazyLock<Selector> = LazyLock::new(|| {
        sel("h2 a span, h2 span.a-text-normal, h2 span, .a-size-medium.a-text-normal, .a-size-base-plus.a-text-normal")
    });

    pub static LINK: LazyLock<Selector> = LazyLock::new(|| sel("a[href]"));

    pub static SPONSORED_LABEL: LazyLock<Selector> = LazyLock::new(|| {
        sel(".puis-sponsored-label-text, .s-sponsored-label-text, .s-sponsored-label-info-icon, .puis-label-popover-default")
    });

    pub static IMAGE: LazyLock<Selector> =
        LazyLock::new(|| sel("img.s-image, .s-product-image-container img"));
}

/// Product detail pages.
pub mod detail {
    use super::*;

    pub static TITLE: LazyLock<Selector> = LazyLock::new(|| sel("#productTitle, #title"));

    pub static SELLING_PRICE: LazyLock<Selector> = LazyLock::new(|| {
        sel("#corePriceDisplay_desktop_feature_div .priceToPay, \
             #corePrice_feature_div .a-price, \
             .priceToPay, \
             #apex_desktop .a-price")
    });

    pub static LEGACY_PRICE: LazyLock<Selector> =
        LazyLock::new(|| sel("#priceblock_dealprice, #priceblock_ourprice, #priceblock_saleprice"));

    pub static REFERENCE_PRICE: LazyLock<Selector> = LazyLock::new(|| {
        sel(".basisPrice .a-price, \
             #corePriceDisplay_desktop_feature_div .a-price.a-text-price, \
             #corePrice_feature_div .a-price.a-text-price, \
             #priceblock_listprice")
    });

    pub static SAVINGS_BADGE: LazyLock<Selector> =
        LazyLock::new(|| sel(".savingsPercentage, #dealBadgeSupportingText"));

    pub static IMAGE: LazyLock<Selector> =
        LazyLock::new(|| sel("#landingImage, #imgTagWrapperId img, #imgBlkFront"));

    pub static DEAL_BADGE: LazyLock<Selector> =
        LazyLock::new(|| sel("#dealBadge_feature_div, #dealBadgeSupportingText, .dealBadge"));
}

/// Shared by both page kinds.
pub static PRICE: LazyLock<Selector> = LazyLock::new(|| sel("span.a-price"));

pub static OFFSCREEN: LazyLock<Selector> = LazyLock::new(|| sel(".a-offscreen"));
