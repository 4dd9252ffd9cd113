use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Stores send `null` where an empty list or `false` is meant.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryNode {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", rename = "hasChildren")]
    pub has_children: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub children: Vec<CategoryNode>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Product {
    #[serde(default, rename = "productId")]
    pub product_id: Option<String>,
    #[serde(default, rename = "productName")]
    pub product_name: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default, rename = "brandId")]
    pub brand_id: Option<i64>,
    #[serde(default, rename = "Manufacturer", alias = "manufacturer")]
    pub manufacturer: Option<String>,
    #[serde(default, rename = "linkText")]
    pub link_text: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub categories: Vec<String>,
    #[serde(default, rename = "categoryId")]
    pub category_id: Option<String>,
    #[serde(default, rename = "productReference")]
    pub product_reference: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", rename = "productClusters")]
    pub product_clusters: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Item {
    #[serde(default, rename = "itemId")]
    pub item_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "nameComplete")]
    pub name_complete: Option<String>,
    #[serde(default)]
    pub ean: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", rename = "referenceId")]
    pub reference_id: Vec<ReferenceId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sellers: Vec<Seller>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReferenceId {
    #[serde(default, rename = "Key")]
    pub key: Option<String>,
    #[serde(default, rename = "Value")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Seller {
    #[serde(default, rename = "sellerId")]
    pub seller_id: Option<String>,
    #[serde(default, rename = "sellerName")]
    pub seller_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", rename = "sellerDefault")]
    pub seller_default: bool,
    #[serde(default, rename = "commertialOffer")]
    pub offer: Option<CommercialOffer>,
}

// Teaser payloads vary between stores; some still carry the serialized
// backing field names, so they stay as raw JSON.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommercialOffer {
    #[serde(default, rename = "Price")]
    pub price: Option<f64>,
    #[serde(default, rename = "ListPrice")]
    pub list_price: Option<f64>,
    #[serde(default, rename = "PriceWithoutDiscount")]
    pub price_without_discount: Option<f64>,
    #[serde(default, rename = "FullSellingPrice")]
    pub full_selling_price: Option<f64>,
    #[serde(default, rename = "IsAvailable")]
    pub is_available: Option<bool>,
    #[serde(default, rename = "AvailableQuantity")]
    pub available_quantity: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default", rename = "Teasers")]
    pub teasers: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default", rename = "PromotionTeasers")]
    pub promotion_teasers: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default", rename = "DiscountHighLight")]
    pub discount_highlight: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Facets {
    #[serde(default, deserialize_with = "null_as_default", rename = "Brands")]
    pub brands: Vec<BrandFacet>,
    #[serde(default, deserialize_with = "null_as_default", rename = "PriceRanges")]
    pub price_ranges: Vec<PriceRangeFacet>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrandFacet {
    #[serde(default, rename = "Id")]
    pub id: Option<i64>,
    #[serde(default, rename = "Name")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", rename = "Quantity")]
    pub quantity: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PriceRangeFacet {
    #[serde(default, rename = "Slug")]
    pub slug: Option<String>,
    #[serde(default, rename = "Name")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default", rename = "Quantity")]
    pub quantity: u64,
}

impl Product {
    /// Highest offer or list price among all sellers of all SKUs.
    pub fn top_price(&self) -> Option<f64> {
        self.items
            .iter()
            .flat_map(|item| &item.sellers)
            .filter_map(|seller| seller.offer.as_ref())
            .flat_map(|offer| [offer.price, offer.list_price])
            .flatten()
            .filter(|price| price.is_finite() && *price > 0.0)
            .reduce(f64::max)
    }
}

impl PriceRangeFacet {
    /// Bounds encoded in slugs such as `de-0-a-2399`.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        let slug = self.slug.as_deref()?;
        let rest = slug.strip_prefix("de-")?;
        let (lo, hi) = rest.split_once("-a-")?;
        let lo = lo.replace(',', ".").parse::<f64>().ok()?;
        let hi = hi.replace(',', ".").parse::<f64>().ok()?;
        (lo <= hi).then_some((lo, hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_payload_parses_with_missing_fields() {
        let raw = r#"[{
            "productId": "123",
            "productName": "Aceite de Girasol Natura 1.5 L",
            "brand": "Natura",
            "linkText": "aceite-natura-15l",
            "categories": ["/Almacen/Aceites/", "/Almacen/"],
            "items": [{
                "itemId": "555",
                "ean": "7790060023684",
                "referenceId": [{"Key": "RefId", "Value": "AC-15"}],
                "sellers": [{
                    "sellerId": "1",
                    "sellerDefault": true,
                    "commertialOffer": {
                        "Price": 2899.5,
                        "ListPrice": 3199,
                        "IsAvailable": true,
                        "Teasers": [{"<Name>k__BackingField": "2x1"}]
                    }
                }]
            }]
        }]"#;

        let products: Vec<Product> = serde_json::from_str(raw).unwrap();
        assert_eq!(products.len(), 1);
        let item = &products[0].items[0];
        let offer = item.sellers[0].offer.as_ref().unwrap();
        assert_eq!(offer.price, Some(2899.5));
        assert_eq!(offer.list_price, Some(3199.0));
        assert_eq!(offer.teasers.len(), 1);
        assert!(products[0].manufacturer.is_none());
    }

    #[test]
    fn test_null_collections_decode_as_empty() {
        let raw = r#"{
            "productId": "9",
            "productName": "Gaseosa Cola 2.25 L",
            "categories": null,
            "productClusters": null,
            "items": [{
                "itemId": "91",
                "referenceId": null,
                "sellers": [{
                    "sellerDefault": null,
                    "commertialOffer": {
                        "Price": 1500,
                        "Teasers": null,
                        "PromotionTeasers": null,
                        "DiscountHighLight": null
                    }
                }]
            }]
        }"#;

        let product: Product = serde_json::from_str(raw).unwrap();
        assert!(product.categories.is_empty());
        assert!(product.product_clusters.is_empty());
        let item = &product.items[0];
        assert!(item.reference_id.is_empty());
        assert!(!item.sellers[0].seller_default);
        let offer = item.sellers[0].offer.as_ref().unwrap();
        assert!(offer.teasers.is_empty());
        assert_eq!(offer.price, Some(1500.0));
    }

    #[test]
    fn test_top_price_spans_items_and_sellers() {
        let raw = r#"{
            "items": [
                {"sellers": [{"commertialOffer": {"Price": 900, "ListPrice": 1200}}]},
                {"sellers": [
                    {"commertialOffer": {"Price": 0}},
                    {"commertialOffer": {"Price": 1500, "ListPrice": null}}
                ]}
            ]
        }"#;
        let product: Product = serde_json::from_str(raw).unwrap();
        assert_eq!(product.top_price(), Some(1500.0));
        assert_eq!(Product::default().top_price(), None);
    }

    #[test]
    fn test_price_range_bounds() {
        let facet = PriceRangeFacet {
            slug: Some("de-100-a-2399".into()),
            name: None,
            quantity: 10,
        };
        assert_eq!(facet.bounds(), Some((100.0, 2399.0)));

        let broken = PriceRangeFacet {
            slug: Some("hasta-100".into()),
            ..PriceRangeFacet::default()
        };
        assert_eq!(broken.bounds(), None);
    }
}
