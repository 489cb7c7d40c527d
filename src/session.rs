use std::time::Duration;

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::{debug, info, warn};

use crate::catalog::{FetchError, Post};
use crate::preview::{self, CancelToken, PreviewContent, PreviewError, PreviewRequest};
use crate::query::{self, LineEditor, Shortcut};
use crate::ui;

pub const MIN_PAGE: u32 = 1;
pub const MAX_PAGE: u32 = 750;
pub const STATUS_TTL: Duration = Duration::from_secs(2);
pub const NO_RESULTS_MESSAGE: &str = "\nNo results found for your query.";
pub const COPIED_MESSAGE: &str = "Copied link to clipboard!";
const NARROW_TABLE_WIDTH: u16 = 42;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("required renderer `{program}` was not found on PATH")]
    StartupDependencyMissing { program: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    EntranceMenu,
    QuitConfirm,
    Browsing,
    TagPopup,
    FatalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MenuFocus {
    #[default]
    Editing,
    Buttons,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLayout {
    /// ID and score only.
    Narrow,
    /// ID, artist and score.
    Wide,
}

impl TableLayout {
    fn for_width(width: u16) -> Self {
        if (width / 4).saturating_sub(4) < NARROW_TABLE_WIDTH {
            TableLayout::Narrow
        } else {
            TableLayout::Wide
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Key(KeyEvent),
    Resize {
        width: u16,
        height: u16,
    },
    PostsFetched {
        generation: u64,
        result: Result<Vec<Post>, FetchError>,
    },
    PreviewLoaded {
        generation: u64,
        result: Result<PreviewContent, PreviewError>,
    },
    StatusExpired {
        token: u64,
    },
    Tick,
}

#[derive(Debug)]
pub enum Effect {
    Fetch {
        generation: u64,
        query: String,
        page: u32,
    },
    Preview {
        generation: u64,
        request: PreviewRequest,
        cancel: CancelToken,
    },
    CopyToClipboard(String),
    ExpireStatus {
        token: u64,
        after: Duration,
    },
    ClearScreen,
    Quit,
}

/// All mutable state of one connected session.
#[derive(Debug)]
pub struct SessionState {
    pub mode: Mode,
    quit_return: Mode,
    pub menu_focus: MenuFocus,
    pub shortcut: Shortcut,
    pub editor: LineEditor,
    /// The in-browse search editor owns the status bar.
    pub search_focused: bool,
    pub active_query: String,
    pub page: u32,
    pub results: Vec<Post>,
    pub selected: usize,
    pub loading: bool,
    pub preview: PreviewContent,
    preview_generation: u64,
    preview_cancel: Option<CancelToken>,
    preview_revision: u64,
    fetch_generation: u64,
    pub show_full_image: bool,
    pub tag_text: String,
    pub tag_scroll: u16,
    pub status_message: Option<String>,
    status_token: u64,
    pub last_error: Option<SessionError>,
    pub width: u16,
    pub height: u16,
    pub table_layout: TableLayout,
    jump_to_post: Option<i64>,
    pub spinner: usize,
}

impl SessionState {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            mode: Mode::EntranceMenu,
            quit_return: Mode::EntranceMenu,
            menu_focus: MenuFocus::Editing,
            shortcut: Shortcut::Latest,
            editor: LineEditor::default(),
            search_focused: false,
            active_query: String::new(),
            page: MIN_PAGE,
            results: Vec::new(),
            selected: 0,
            loading: false,
            preview: PreviewContent::Empty,
            preview_generation: 0,
            preview_cancel: None,
            preview_revision: 0,
            fetch_generation: 0,
            show_full_image: false,
            tag_text: String::new(),
            tag_scroll: 0,
            status_message: None,
            status_token: 0,
            last_error: None,
            width,
            height,
            table_layout: TableLayout::for_width(width),
            jump_to_post: None,
            spinner: 0,
        }
    }

    pub fn preview_generation(&self) -> u64 {
        self.preview_generation
    }

    pub fn fetch_generation(&self) -> u64 {
        self.fetch_generation
    }

    /// Bumped whenever the preview pane content changes.
    pub fn preview_revision(&self) -> u64 {
        self.preview_revision
    }

    pub fn selected_post(&self) -> Option<&Post> {
        self.results.get(self.selected)
    }

    pub fn fail(&mut self, err: SessionError) {
        warn!(error = %err, "session entered fatal error state");
        self.loading = false;
        self.cancel_preview();
        self.last_error = Some(err);
        if self.mode == Mode::QuitConfirm {
            self.quit_return = Mode::FatalError;
        } else {
            self.mode = Mode::FatalError;
        }
    }

    fn set_preview(&mut self, content: PreviewContent) {
        self.preview = content;
        self.preview_revision = self.preview_revision.wrapping_add(1);
    }

    fn cancel_preview(&mut self) {
        if let Some(token) = self.preview_cancel.take() {
            token.cancel();
            self.preview_generation += 1;
        }
    }

    fn clear_results(&mut self) {
        self.results.clear();
        self.selected = 0;
        self.cancel_preview();
        self.set_preview(PreviewContent::Empty);
    }

    fn set_status(&mut self, message: &str) -> Effect {
        self.status_token += 1;
        self.status_message = Some(message.to_string());
        Effect::ExpireStatus {
            token: self.status_token,
            after: STATUS_TTL,
        }
    }
}

/// Fails the session immediately when the renderer cannot be resolved.
pub fn startup_check(state: &mut SessionState, program: &str) {
    if preview::locate_program(program).is_none() {
        state.fail(SessionError::StartupDependencyMissing {
            program: program.to_string(),
        });
    }
}

pub fn update(state: &mut SessionState, event: Event) -> Vec<Effect> {
    match event {
        Event::Key(key) => {
            if key.kind == KeyEventKind::Release {
                return Vec::new();
            }
            handle_key(state, key)
        }
        Event::Resize { width, height } => handle_resize(state, width, height),
        Event::PostsFetched { generation, result } => handle_posts(state, generation, result),
        Event::PreviewLoaded { generation, result } => handle_preview(state, generation, result),
        Event::StatusExpired { token } => {
            if token == state.status_token {
                state.status_message = None;
            }
            Vec::new()
        }
        Event::Tick => {
            if state.loading {
                state.spinner = state.spinner.wrapping_add(1);
            }
            Vec::new()
        }
    }
}

fn is_ctrl_c(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL) && matches!(key.code, KeyCode::Char('c'))
}

fn enter_quit_confirm(state: &mut SessionState) -> Vec<Effect> {
    state.quit_return = state.mode;
    state.mode = Mode::QuitConfirm;
    Vec::new()
}

fn handle_key(state: &mut SessionState, key: KeyEvent) -> Vec<Effect> {
    if state.mode != Mode::QuitConfirm && is_ctrl_c(&key) {
        return enter_quit_confirm(state);
    }

    match state.mode {
        Mode::QuitConfirm => handle_quit_key(state, key),
        Mode::FatalError => match key.code {
            KeyCode::Esc | KeyCode::Char('q') => enter_quit_confirm(state),
            _ => Vec::new(),
        },
        Mode::EntranceMenu => match state.menu_focus {
            MenuFocus::Editing => handle_menu_edit_key(state, key),
            MenuFocus::Buttons => handle_menu_button_key(state, key),
        },
        Mode::TagPopup => handle_tag_key(state, key),
        Mode::Browsing if state.search_focused => handle_browse_search_key(state, key),
        Mode::Browsing => handle_browse_key(state, key),
    }
}

fn handle_quit_key(state: &mut SessionState, key: KeyEvent) -> Vec<Effect> {
    match key.code {
        KeyCode::Char('y') | KeyCode::Char('Y') => {
            info!("quit confirmed");
            vec![Effect::Quit]
        }
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
            state.mode = state.quit_return;
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// Feeds a key to a line editor. Returns false when the key is not an edit.
fn edit_line(editor: &mut LineEditor, key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Char(ch)
            if !key
                .modifiers
                .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
        {
            editor.insert(ch)
        }
        KeyCode::Backspace => editor.backspace(),
        KeyCode::Delete => editor.delete(),
        KeyCode::Left => editor.left(),
        KeyCode::Right => editor.right(),
        KeyCode::Home => editor.home(),
        KeyCode::End => editor.end(),
        _ => return false,
    }
    true
}

fn handle_menu_edit_key(state: &mut SessionState, key: KeyEvent) -> Vec<Effect> {
    match key.code {
        KeyCode::Enter => {
            let query = state.editor.text().to_string();
            start_search(state, query)
        }
        KeyCode::Tab | KeyCode::BackTab => {
            state.menu_focus = MenuFocus::Buttons;
            Vec::new()
        }
        KeyCode::Esc => enter_quit_confirm(state),
        _ => {
            edit_line(&mut state.editor, &key);
            Vec::new()
        }
    }
}

fn handle_menu_button_key(state: &mut SessionState, key: KeyEvent) -> Vec<Effect> {
    match key.code {
        KeyCode::Enter => {
            let query = state.shortcut.query();
            state.editor.set_text(query);
            start_search(state, query.to_string())
        }
        KeyCode::Tab | KeyCode::BackTab => {
            state.menu_focus = MenuFocus::Editing;
            Vec::new()
        }
        KeyCode::Left | KeyCode::Char('h') => {
            state.shortcut = Shortcut::Latest;
            Vec::new()
        }
        KeyCode::Right | KeyCode::Char('l') => {
            state.shortcut = Shortcut::Popular;
            Vec::new()
        }
        KeyCode::Char('q') | KeyCode::Esc => enter_quit_confirm(state),
        _ => Vec::new(),
    }
}

/// Commits `query` verbatim and starts browsing its first page.
fn start_search(state: &mut SessionState, query: String) -> Vec<Effect> {
    state.active_query = query;
    state.page = MIN_PAGE;
    state.mode = Mode::Browsing;
    state.search_focused = false;
    state.jump_to_post = None;
    let mut effects = vec![Effect::ClearScreen];
    effects.extend(reload(state));
    effects
}

/// Drops the current result set and fetches `(active_query, page)` again.
fn reload(state: &mut SessionState) -> Vec<Effect> {
    state.clear_results();
    state.loading = true;
    state.spinner = 0;
    state.fetch_generation += 1;
    info!(
        query = %state.active_query,
        page = state.page,
        generation = state.fetch_generation,
        "scheduling fetch"
    );
    vec![Effect::Fetch {
        generation: state.fetch_generation,
        query: state.active_query.clone(),
        page: state.page,
    }]
}

fn handle_browse_search_key(state: &mut SessionState, key: KeyEvent) -> Vec<Effect> {
    match key.code {
        KeyCode::Enter => {
            let query = state.editor.text().to_string();
            start_search(state, query)
        }
        KeyCode::Esc => {
            state.search_focused = false;
            Vec::new()
        }
        _ => {
            edit_line(&mut state.editor, &key);
            Vec::new()
        }
    }
}

fn handle_browse_key(state: &mut SessionState, key: KeyEvent) -> Vec<Effect> {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => back_to_menu(state),
        KeyCode::Char('c') => copy_link(state),
        KeyCode::Char('/') => {
            state.editor.set_text(&state.active_query);
            state.search_focused = true;
            Vec::new()
        }
        KeyCode::Char('r') => refresh(state),
        KeyCode::Char('e') => {
            state.show_full_image = !state.show_full_image;
            if state.loading || state.results.is_empty() {
                return Vec::new();
            }
            request_preview(state)
        }
        KeyCode::Char('p') => view_pool(state),
        KeyCode::Char('t') => {
            if let Some(post) = state.selected_post() {
                state.tag_text = post.tags.display_text();
                state.tag_scroll = 0;
                state.mode = Mode::TagPopup;
            }
            Vec::new()
        }
        KeyCode::Char('h') | KeyCode::Left => change_page(state, -1),
        KeyCode::Char('l') | KeyCode::Right => change_page(state, 1),
        _ => move_cursor(state, key.code),
    }
}

fn back_to_menu(state: &mut SessionState) -> Vec<Effect> {
    state.clear_results();
    // Anything still in flight belongs to the session that was just left.
    state.fetch_generation += 1;
    state.loading = false;
    state.editor.set_text(&state.active_query);
    state.menu_focus = MenuFocus::Editing;
    state.search_focused = false;
    state.mode = Mode::EntranceMenu;
    vec![Effect::ClearScreen]
}

fn copy_link(state: &mut SessionState) -> Vec<Effect> {
    let Some(url) = state.selected_post().map(|post| post.file_url().to_string()) else {
        return Vec::new();
    };
    let expire = state.set_status(COPIED_MESSAGE);
    vec![Effect::CopyToClipboard(url), expire]
}

fn refresh(state: &mut SessionState) -> Vec<Effect> {
    let mut effects = vec![Effect::ClearScreen];
    effects.extend(reload(state));
    effects
}

fn change_page(state: &mut SessionState, delta: i64) -> Vec<Effect> {
    if !state.loading {
        let next = i64::from(state.page) + delta;
        state.page = next.clamp(i64::from(MIN_PAGE), i64::from(MAX_PAGE)) as u32;
    }
    refresh(state)
}

fn view_pool(state: &mut SessionState) -> Vec<Effect> {
    if state.loading {
        return Vec::new();
    }
    let Some((post_id, pool_id)) = state
        .selected_post()
        .and_then(|post| post.first_pool().map(|pool| (post.id, pool)))
    else {
        return Vec::new();
    };
    let pool = query::pool_query(pool_id);
    if state.active_query == pool {
        return Vec::new();
    }
    info!(post = post_id, pool = pool_id, "opening pool");
    state.jump_to_post = Some(post_id);
    state.active_query = pool;
    state.editor.set_text(&state.active_query);
    state.page = MIN_PAGE;
    refresh(state)
}

fn move_cursor(state: &mut SessionState, code: KeyCode) -> Vec<Effect> {
    if state.loading || state.results.is_empty() {
        return Vec::new();
    }
    let last = state.results.len() - 1;
    let page_rows = ui::screen_layout(state.width, state.height).table_rows().max(1);
    let current = state.selected;
    let next = match code {
        KeyCode::Up | KeyCode::Char('k') => current.saturating_sub(1),
        KeyCode::Down | KeyCode::Char('j') => current.saturating_add(1).min(last),
        KeyCode::PageUp => current.saturating_sub(page_rows),
        KeyCode::PageDown => current.saturating_add(page_rows).min(last),
        KeyCode::Home | KeyCode::Char('g') => 0,
        KeyCode::End | KeyCode::Char('G') => last,
        _ => return Vec::new(),
    };
    if next == current {
        return Vec::new();
    }
    state.selected = next;
    request_preview(state)
}

fn handle_tag_key(state: &mut SessionState, key: KeyEvent) -> Vec<Effect> {
    match key.code {
        KeyCode::Char('t') | KeyCode::Esc => state.mode = Mode::Browsing,
        KeyCode::Up | KeyCode::Char('k') => state.tag_scroll = state.tag_scroll.saturating_sub(1),
        KeyCode::Down | KeyCode::Char('j') => state.tag_scroll = state.tag_scroll.saturating_add(1),
        _ => {}
    }
    Vec::new()
}

/// Cancels the in-flight preview and asks for the selected post under a new
/// generation.
fn request_preview(state: &mut SessionState) -> Vec<Effect> {
    let Some(post) = state.results.get(state.selected) else {
        return Vec::new();
    };
    let placement = ui::screen_layout(state.width, state.height).preview_placement();
    let request = PreviewRequest::for_post(post, state.show_full_image, placement);

    if let Some(previous) = state.preview_cancel.take() {
        previous.cancel();
    }
    state.preview_generation += 1;
    let cancel = CancelToken::new();
    state.preview_cancel = Some(cancel.clone());
    state.set_preview(PreviewContent::Loading);
    debug!(
        post = request.post_id,
        generation = state.preview_generation,
        "requesting preview"
    );

    vec![
        Effect::ClearScreen,
        Effect::Preview {
            generation: state.preview_generation,
            request,
            cancel,
        },
    ]
}

fn handle_resize(state: &mut SessionState, width: u16, height: u16) -> Vec<Effect> {
    if (state.width, state.height) == (width, height) {
        return Vec::new();
    }
    state.width = width;
    state.height = height;
    let browsing = matches!(state.mode, Mode::Browsing | Mode::TagPopup);
    if browsing && !state.loading && !state.results.is_empty() {
        return request_preview(state);
    }
    vec![Effect::ClearScreen]
}

fn handle_posts(
    state: &mut SessionState,
    generation: u64,
    result: Result<Vec<Post>, FetchError>,
) -> Vec<Effect> {
    if generation != state.fetch_generation {
        debug!(generation, current = state.fetch_generation, "discarding stale fetch");
        return Vec::new();
    }
    state.loading = false;

    let posts = match result {
        Ok(posts) => posts,
        Err(err) => {
            state.fail(SessionError::Fetch(err));
            return vec![Effect::ClearScreen];
        }
    };

    info!(count = posts.len(), query = %state.active_query, page = state.page, "posts loaded");
    state.results = posts;
    state.selected = 0;
    state.table_layout = TableLayout::for_width(state.width);
    if state.mode == Mode::TagPopup {
        state.mode = Mode::Browsing;
    }
    if state.quit_return == Mode::TagPopup {
        state.quit_return = Mode::Browsing;
    }

    if let Some(post_id) = state.jump_to_post.take() {
        if let Some(index) = state.results.iter().position(|post| post.id == post_id) {
            state.selected = index;
        }
    }

    if state.results.is_empty() {
        state.set_preview(PreviewContent::Message(NO_RESULTS_MESSAGE.to_string()));
        return vec![Effect::ClearScreen];
    }
    request_preview(state)
}

fn handle_preview(
    state: &mut SessionState,
    generation: u64,
    result: Result<PreviewContent, PreviewError>,
) -> Vec<Effect> {
    if generation != state.preview_generation {
        debug!(generation, current = state.preview_generation, "discarding stale preview");
        return Vec::new();
    }
    state.preview_cancel = None;
    match result {
        Ok(content) => state.set_preview(content),
        Err(err) if err.is_cancelled() => {}
        Err(err) => {
            debug!(error = %err, "preview failed");
            state.set_preview(PreviewContent::failed());
        }
    }
    Vec::new()
}
