//! Casetrace pipeline stages
//!
//! Each stage is a queue processor; stages hand off to each other by
//! enqueueing jobs, never by direct calls. State lives in the persisted
//! case/document/page records.

pub mod completion;
pub mod context;
pub mod merge;
pub mod native_text;
pub mod ocr_poller;
pub mod orchestrator;
pub mod page_extractor;
pub mod splitter;
pub mod structuring;

#[cfg(test)]
pub(crate) mod testutil {
    use lopdf::{dictionary, Document, Object, Stream};

    /// Build a small in-memory PDF, one entry of `texts` per page.
    pub fn sample_pdf(texts: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in texts {
            let content = if text.is_empty() {
                String::new()
            } else {
                format!("BT\n/F1 12 Tf\n72 720 Td\n({}) Tj\nET", text)
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let resources = dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            };
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Contents" => content_id,
                "Resources" => resources,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).expect("serialize sample pdf");
        out
    }
}
