//! Behavioural scenarios for block annotations under local edits.
//!
//! Offsets use the flattened block position space: `<h1>h</h1>` spans 0–3,
//! the first paragraph starts at 3.

use std::cell::RefCell;
use std::rc::Rc;

use marginalia_core::{AnnotationConfig, AnnotationSummary, DecorationSet, Editor, ReplicaId};
use serde_json::{Value, json};

const ONE: &str = "<h1>h</h1><p>block 1</p>";
const THREE: &str = "<h1>h</h1><p>block 1</p><p>block 2</p><p>block 3</p>";

fn editor(html: &str) -> Editor {
    Editor::with_content(html, ReplicaId(1), AnnotationConfig::default()).unwrap()
}

fn annotate(ed: &mut Editor, id: &str, pos: usize) {
    ed.set_cursor(pos).unwrap();
    ed.add_annotation_with_id(id, json!({ "text": id })).unwrap();
}

fn span(ed: &Editor, id: &str) -> Option<(usize, usize)> {
    ed.decorations().get(id).map(|deco| (deco.start, deco.end))
}

fn data(ed: &Editor, id: &str) -> Option<Value> {
    ed.decorations().get(id).map(|deco| deco.data.clone())
}

fn settle(ed: &mut Editor) {
    ed.run_deferred().unwrap();
}

// ---------------------------------------------------------------------------
// Adding and mapping
// ---------------------------------------------------------------------------

#[test]
fn annotation_spans_the_whole_block_wherever_the_cursor_is() {
    for cursor in [4, 6, 11] {
        let mut ed = editor(ONE);
        annotate(&mut ed, "c1", cursor);
        assert_eq!(span(&ed, "c1"), Some((3, 12)), "cursor {cursor}");
    }
}

#[test]
fn typing_before_the_block_shifts_the_decoration() {
    let mut ed = editor(ONE);
    annotate(&mut ed, "c1", 4);
    ed.insert_text(2, "hello").unwrap();
    assert_eq!(ed.html(), "<h1>hhello</h1><p>block 1</p>");
    assert_eq!(span(&ed, "c1"), Some((8, 17)));
    assert_eq!(data(&ed, "c1"), Some(json!({ "text": "c1" })));
}

#[test]
fn typing_inside_the_block_widens_the_decoration() {
    let mut ed = editor(ONE);
    annotate(&mut ed, "c1", 4);
    ed.insert_text(6, "oo").unwrap();
    assert_eq!(ed.html(), "<h1>h</h1><p>blooock 1</p>");
    assert_eq!(span(&ed, "c1"), Some((3, 14)));
}

#[test]
fn two_annotated_blocks() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 4);
    annotate(&mut ed, "c2", 13);
    assert_eq!(ed.decorations().spans(), vec![(3, 12), (12, 21)]);
}

// ---------------------------------------------------------------------------
// Splits
// ---------------------------------------------------------------------------

#[test]
fn split_keeps_annotation_on_the_front_block() {
    let mut ed = editor(ONE);
    annotate(&mut ed, "c1", 4);
    ed.set_cursor(6).unwrap();
    assert!(ed.press_enter().unwrap());
    settle(&mut ed);
    assert_eq!(ed.html(), "<h1>h</h1><p>bl</p><p>ock 1</p>");
    assert_eq!(span(&ed, "c1"), Some((3, 7)));
}

#[test]
fn split_then_backspace_restores_the_block() {
    let mut ed = editor(ONE);
    annotate(&mut ed, "c1", 4);
    ed.set_cursor(6).unwrap();
    ed.press_enter().unwrap();
    settle(&mut ed);
    ed.set_cursor(8).unwrap();
    assert!(ed.press_backspace().unwrap());
    settle(&mut ed);
    assert_eq!(ed.html(), ONE);
    assert_eq!(span(&ed, "c1"), Some((3, 12)));
}

#[test]
fn split_then_delete_restores_the_block() {
    let mut ed = editor(ONE);
    annotate(&mut ed, "c1", 4);
    ed.set_cursor(6).unwrap();
    ed.press_enter().unwrap();
    settle(&mut ed);
    ed.set_cursor(6).unwrap();
    assert!(ed.press_delete().unwrap());
    settle(&mut ed);
    assert_eq!(ed.html(), ONE);
    assert_eq!(span(&ed, "c1"), Some((3, 12)));
}

#[test]
fn split_leaves_later_annotations_in_place() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 4);
    annotate(&mut ed, "c2", 13);
    ed.set_cursor(6).unwrap();
    ed.press_enter().unwrap();
    settle(&mut ed);
    assert_eq!(span(&ed, "c1"), Some((3, 7)));
    assert_eq!(span(&ed, "c2"), Some((14, 23)));
}

#[test]
fn split_at_block_start_inserts_an_empty_block_before() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 4);
    annotate(&mut ed, "c2", 13);
    ed.set_cursor(4).unwrap();
    ed.press_enter().unwrap();
    settle(&mut ed);
    assert!(ed.html().starts_with("<h1>h</h1><p></p><p>block 1</p>"));
    assert_eq!(span(&ed, "c1"), Some((5, 14)));
    assert_eq!(span(&ed, "c2"), Some((14, 23)));
}

#[test]
fn decorations_are_stale_until_deferred_relocation_runs() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 4);
    ed.set_cursor(4).unwrap();
    ed.press_enter().unwrap();
    assert_eq!(span(&ed, "c1"), Some((3, 12)));
    settle(&mut ed);
    assert_eq!(span(&ed, "c1"), Some((5, 14)));
}

#[test]
fn mid_block_split_never_maps_a_span_across_both_halves() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut ed = editor(ONE);
    annotate(&mut ed, "c1", 4);
    let sink = Rc::clone(&seen);
    ed.set_sink(move |set: &DecorationSet, _: &[AnnotationSummary]| {
        sink.borrow_mut().push(set.spans());
    });
    ed.set_cursor(6).unwrap();
    ed.press_enter().unwrap();
    assert_eq!(ed.html(), "<h1>h</h1><p>bl</p><p>ock 1</p>");
    assert_eq!(ed.decorations().spans(), vec![(3, 12)]);
    settle(&mut ed);
    assert_eq!(ed.decorations().spans(), vec![(3, 7)]);
    assert!(!seen.borrow().iter().any(|spans| spans.contains(&(3, 14))));
    assert_eq!(seen.borrow().last(), Some(&vec![(3, 7)]));
}

// ---------------------------------------------------------------------------
// Joins
// ---------------------------------------------------------------------------

#[test]
fn delete_joins_following_block_into_annotated_block() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 13);
    ed.set_cursor(20).unwrap();
    assert!(ed.press_delete().unwrap());
    settle(&mut ed);
    assert_eq!(ed.html(), "<h1>h</h1><p>block 1</p><p>block 2block 3</p>");
    assert_eq!(span(&ed, "c1"), Some((12, 28)));
}

#[test]
fn delete_at_end_of_first_paragraph() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 4);
    ed.set_cursor(11).unwrap();
    ed.press_delete().unwrap();
    settle(&mut ed);
    assert_eq!(span(&ed, "c1"), Some((3, 19)));
}

#[test]
fn delete_join_merges_two_annotated_blocks() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 13);
    annotate(&mut ed, "c2", 22);
    ed.set_cursor(20).unwrap();
    ed.press_delete().unwrap();
    settle(&mut ed);
    assert_eq!(span(&ed, "c1"), Some((12, 28)));
    assert_eq!(span(&ed, "c2"), Some((12, 28)));
    assert_eq!(data(&ed, "c1"), Some(json!({ "text": "c1" })));
    assert_eq!(data(&ed, "c2"), Some(json!({ "text": "c2" })));
}

#[test]
fn delete_join_leaves_farther_block_alone() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 4);
    annotate(&mut ed, "c2", 22);
    ed.set_cursor(11).unwrap();
    ed.press_delete().unwrap();
    settle(&mut ed);
    assert_eq!(span(&ed, "c1"), Some((3, 19)));
    assert_eq!(span(&ed, "c2"), Some((19, 28)));
}

#[test]
fn backspace_join_merges_two_annotated_blocks() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 13);
    annotate(&mut ed, "c2", 22);
    ed.set_cursor(22).unwrap();
    assert!(ed.press_backspace().unwrap());
    settle(&mut ed);
    assert_eq!(span(&ed, "c1"), Some((12, 28)));
    assert_eq!(span(&ed, "c2"), Some((12, 28)));
}

#[test]
fn backspace_join_relocates_absorbed_annotation() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 4);
    annotate(&mut ed, "c2", 13);
    annotate(&mut ed, "c3", 22);
    ed.set_cursor(13).unwrap();
    ed.press_backspace().unwrap();
    settle(&mut ed);
    assert_eq!(span(&ed, "c1"), Some((3, 19)));
    assert_eq!(span(&ed, "c2"), Some((3, 19)));
    assert_eq!(span(&ed, "c3"), Some((19, 28)));
    assert_eq!(data(&ed, "c3"), Some(json!({ "text": "c3" })));
}

#[test]
fn joining_an_empty_block_only_refreshes() {
    let mut ed = editor("<p>one</p><p></p>");
    annotate(&mut ed, "c1", 1);
    ed.set_cursor(4).unwrap();
    ed.press_delete().unwrap();
    settle(&mut ed);
    assert_eq!(ed.html(), "<p>one</p>");
    assert_eq!(span(&ed, "c1"), Some((0, 5)));
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[test]
fn undo_after_join_restores_the_pre_join_anchor() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c2", 22);
    let before = ed.store().snapshot();
    ed.set_cursor(20).unwrap();
    ed.press_delete().unwrap();
    settle(&mut ed);
    let after = ed.store().snapshot();
    assert_ne!(before, after);

    assert!(ed.undo());
    assert_eq!(ed.store().snapshot(), before);
    assert!(ed.redo());
    assert_eq!(ed.store().snapshot(), after);
}

#[test]
fn clear_is_one_undo_step() {
    let mut ed = editor(THREE);
    annotate(&mut ed, "c1", 4);
    annotate(&mut ed, "c2", 13);
    ed.clear_annotations().unwrap();
    assert!(ed.decorations().is_empty());
    assert!(ed.undo());
    assert_eq!(ed.decorations().spans(), vec![(3, 12), (12, 21)]);
}

#[test]
fn refresh_recomputes_without_history() {
    let mut ed = editor(ONE);
    annotate(&mut ed, "c1", 4);
    let depth = ed.history().undo_depth();
    ed.refresh_decorations().unwrap();
    assert_eq!(ed.history().undo_depth(), depth);
    assert_eq!(span(&ed, "c1"), Some((3, 12)));
}
